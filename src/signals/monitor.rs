//! Signal Monitor (§4.C9): periodic scan over stored series producing
//! typed `market_signals` rows. Every detector reads only already-stored
//! data — no connector calls happen here. Writes are idempotent on
//! (time, symbol, signal_type) via `Storage::insert_market_signals`.

use crate::context::Context;
use crate::storage::Storage;
use crate::types::{MarketSignal, Severity, SignalSide, SignalType, Timeframe};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Default universe size (supplemented from original_source's
/// `TOP_SYMBOLS_LIMIT`).
pub const TOP_SYMBOLS_LIMIT: u32 = 10;

const CVD_TIMEFRAMES: [Timeframe; 3] = [Timeframe::OneMinute, Timeframe::FifteenMinutes, Timeframe::OneHour];
const CVD_WINDOW_BARS: i64 = 20;

/// Configuration-overridable thresholds (§4.C9, defaults from
/// original_source's `THRESHOLDS` dict).
#[derive(Debug, Clone, Copy)]
pub struct SignalThresholds {
    pub funding_extreme: Decimal,
    pub oi_spike_pct: Decimal,
    pub oi_spike_max_gap_minutes: i64,
    pub whale_liquidation_usd: Decimal,
    pub liquidation_cluster_usd: Decimal,
    pub obi_extreme: Decimal,
    pub cvd_hysteresis_ratio: Decimal,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            funding_extreme: Decimal::new(5, 4),
            oi_spike_pct: Decimal::new(5, 2),
            oi_spike_max_gap_minutes: 70,
            whale_liquidation_usd: Decimal::from(500_000),
            liquidation_cluster_usd: Decimal::from(3_000_000),
            obi_extreme: Decimal::new(6, 1),
            cvd_hysteresis_ratio: Decimal::new(998, 3),
        }
    }
}

fn severity_for_ratio(ratio: Decimal) -> Severity {
    if ratio >= Decimal::from(3) {
        Severity::Critical
    } else if ratio >= Decimal::from(1) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Entry point (§4.C9): scans up to `TOP_SYMBOLS_LIMIT` active markets
/// plus the global liquidation stream over the last 5 minutes, writes
/// every detected signal, and returns the count stored.
pub async fn run_signal_scan(ctx: &Context, thresholds: &SignalThresholds) -> Result<usize> {
    let markets = ctx.db.list_active_markets(TOP_SYMBOLS_LIMIT)?;
    let now = ctx.now();
    let mut signals = Vec::new();

    for market in &markets {
        if let Some(s) = detect_funding_extreme(&ctx.db, market.id, &market.symbol, thresholds)? {
            signals.push(s);
        }
        if let Some(s) = detect_oi_spike(&ctx.db, market.id, &market.symbol, thresholds)? {
            signals.push(s);
        }
        if let Some(s) = detect_obi_extreme(&ctx.db, market.id, &market.symbol, thresholds)? {
            signals.push(s);
        }
        signals.extend(detect_cvd_divergence(&ctx.db, market.id, &market.symbol, now, thresholds)?);
    }

    signals.extend(detect_liquidation_signals(&ctx.db, now, thresholds)?);

    ctx.db.insert_market_signals(&signals)
}

fn detect_funding_extreme(
    db: &Storage,
    market_id: i64,
    symbol: &str,
    thresholds: &SignalThresholds,
) -> Result<Option<MarketSignal>> {
    let Some((time, rate)) = db.recent_metrics(market_id, "funding_rate", 1)?.into_iter().next() else {
        return Ok(None);
    };
    if rate.abs() <= thresholds.funding_extreme {
        return Ok(None);
    }
    let side = if rate > Decimal::ZERO {
        SignalSide::Bearish
    } else {
        SignalSide::Bullish
    };
    Ok(Some(MarketSignal {
        time,
        symbol: symbol.to_string(),
        signal_type: SignalType::FundingExtreme,
        side,
        severity: severity_for_ratio(rate.abs() / thresholds.funding_extreme),
        price_at_signal: None,
        message: format!(
            "funding rate {rate} exceeds threshold {}",
            thresholds.funding_extreme
        ),
        metadata: serde_json::json!({ "funding_rate": rate.to_string() }),
    }))
}

fn detect_oi_spike(
    db: &Storage,
    market_id: i64,
    symbol: &str,
    thresholds: &SignalThresholds,
) -> Result<Option<MarketSignal>> {
    let recent = db.recent_metrics(market_id, "open_interest", 2)?;
    if recent.len() < 2 {
        return Ok(None);
    }
    let (t_latest, oi_latest) = recent[0];
    let (t_prior, oi_prior) = recent[1];
    let gap_minutes = (t_latest - t_prior).num_minutes();
    if gap_minutes <= 0 || gap_minutes > thresholds.oi_spike_max_gap_minutes || oi_prior.is_zero() {
        return Ok(None);
    }
    let change = (oi_latest - oi_prior) / oi_prior;
    if change.abs() <= thresholds.oi_spike_pct {
        return Ok(None);
    }
    let side = if change > Decimal::ZERO {
        SignalSide::Bullish
    } else {
        SignalSide::Bearish
    };
    Ok(Some(MarketSignal {
        time: t_latest,
        symbol: symbol.to_string(),
        signal_type: SignalType::OiSpike,
        side,
        severity: severity_for_ratio(change.abs() / thresholds.oi_spike_pct),
        price_at_signal: None,
        message: format!(
            "open interest changed {}% in {gap_minutes}m",
            (change * Decimal::ONE_HUNDRED).round_dp(2)
        ),
        metadata: serde_json::json!({
            "oi_prior": oi_prior.to_string(),
            "oi_latest": oi_latest.to_string(),
        }),
    }))
}

fn detect_obi_extreme(
    db: &Storage,
    market_id: i64,
    symbol: &str,
    thresholds: &SignalThresholds,
) -> Result<Option<MarketSignal>> {
    let Some((time, obi)) = db.recent_metrics(market_id, "obi", 1)?.into_iter().next() else {
        return Ok(None);
    };
    if obi.abs() < thresholds.obi_extreme {
        return Ok(None);
    }
    let side = if obi > Decimal::ZERO {
        SignalSide::Bullish
    } else {
        SignalSide::Bearish
    };
    Ok(Some(MarketSignal {
        time,
        symbol: symbol.to_string(),
        signal_type: SignalType::ObiExtreme,
        side,
        severity: Severity::Warning,
        price_at_signal: None,
        message: format!("order book imbalance {obi} exceeds {}", thresholds.obi_extreme),
        metadata: serde_json::json!({ "obi": obi.to_string() }),
    }))
}

/// `second` diverges below `first` beyond the hysteresis band: true once
/// `second` drops past `ratio` of `first`'s magnitude (§4.C9: "CVD ratio
/// <= 0.998 of its prior value").
fn diverges_down(first: Decimal, second: Decimal, ratio: Decimal) -> bool {
    let band = first.abs() * (Decimal::ONE - ratio);
    second <= first - band
}

fn diverges_up(first: Decimal, second: Decimal, ratio: Decimal) -> bool {
    let band = first.abs() * (Decimal::ONE - ratio);
    second >= first + band
}

/// CVD divergence (§4.C9): for each of {1m, 15m, 1h}, compares first-half
/// vs second-half price highs/lows against cumulative CVD over the same
/// bars. CVD is reconstructed by cumulatively summing the `cvd_delta`
/// metric points whose time matches a bar's bucket_start_time, carrying
/// the running total forward across bars with no delta recorded.
fn detect_cvd_divergence(
    db: &Storage,
    market_id: i64,
    symbol: &str,
    now: DateTime<Utc>,
    thresholds: &SignalThresholds,
) -> Result<Vec<MarketSignal>> {
    let mut out = Vec::new();
    for timeframe in CVD_TIMEFRAMES {
        let start = now - timeframe.duration() * (CVD_WINDOW_BARS as i32);
        let bars = db.get_ohlcv_range(market_id, timeframe, start, now)?;
        if (bars.len() as i64) < 4 {
            continue;
        }
        let deltas = db.metrics_range(market_id, "cvd_delta", start, now)?;
        let delta_by_time: HashMap<i64, Decimal> =
            deltas.into_iter().map(|(t, v)| (t.timestamp(), v)).collect();

        let mut running = Decimal::ZERO;
        let cvd: Vec<Decimal> = bars
            .iter()
            .map(|bar| {
                if let Some(delta) = delta_by_time.get(&bar.bucket_start_time.timestamp()) {
                    running += *delta;
                }
                running
            })
            .collect();

        let mid = bars.len() / 2;
        let (price_first, price_second) = (&bars[..mid], &bars[mid..]);
        let (cvd_first, cvd_second) = (&cvd[..mid], &cvd[mid..]);

        let price_first_high = price_first.iter().map(|b| b.high).max().unwrap();
        let price_second_high = price_second.iter().map(|b| b.high).max().unwrap();
        let price_first_low = price_first.iter().map(|b| b.low).min().unwrap();
        let price_second_low = price_second.iter().map(|b| b.low).min().unwrap();

        let cvd_first_high = cvd_first.iter().copied().max().unwrap();
        let cvd_second_high = cvd_second.iter().copied().max().unwrap();
        let cvd_first_low = cvd_first.iter().copied().min().unwrap();
        let cvd_second_low = cvd_second.iter().copied().min().unwrap();

        let current_price = bars.last().unwrap().close;
        let time = bars.last().unwrap().bucket_start_time;

        if price_second_high > price_first_high
            && diverges_down(cvd_first_high, cvd_second_high, thresholds.cvd_hysteresis_ratio)
        {
            out.push(MarketSignal {
                time,
                symbol: symbol.to_string(),
                signal_type: SignalType::CvdDivergence,
                side: SignalSide::Bearish,
                severity: Severity::Warning,
                price_at_signal: Some(current_price),
                message: format!("{timeframe} price higher-high, CVD lower-high"),
                metadata: serde_json::json!({ "timeframe": timeframe.as_str() }),
            });
        } else if price_second_low < price_first_low
            && diverges_up(cvd_first_low, cvd_second_low, thresholds.cvd_hysteresis_ratio)
        {
            out.push(MarketSignal {
                time,
                symbol: symbol.to_string(),
                signal_type: SignalType::CvdDivergence,
                side: SignalSide::Bullish,
                severity: Severity::Warning,
                price_at_signal: Some(current_price),
                message: format!("{timeframe} price lower-low, CVD higher-low"),
                metadata: serde_json::json!({ "timeframe": timeframe.as_str() }),
            });
        }
    }
    Ok(out)
}

/// Whale liquidation + liquidation cluster (§4.C9), both driven off the
/// same `liquidations_since` scan: a single liquidation over threshold
/// fires one signal, and the 1-minute (symbol, side) sum feeds the
/// cluster check.
fn detect_liquidation_signals(
    db: &Storage,
    now: DateTime<Utc>,
    thresholds: &SignalThresholds,
) -> Result<Vec<MarketSignal>> {
    let since = now - ChronoDuration::minutes(5);
    let liquidations = db.liquidations_since(since)?;
    let mut out = Vec::new();

    for liq in &liquidations {
        if liq.value_usd >= thresholds.whale_liquidation_usd {
            out.push(MarketSignal {
                time: liq.time,
                symbol: liq.symbol.clone(),
                signal_type: SignalType::WhaleLiquidation,
                side: if liq.side == crate::types::Side::Sell {
                    SignalSide::Bearish
                } else {
                    SignalSide::Bullish
                },
                severity: severity_for_ratio(liq.value_usd / thresholds.whale_liquidation_usd),
                price_at_signal: Some(liq.price),
                message: format!("single liquidation {} exceeds {}", liq.value_usd, thresholds.whale_liquidation_usd),
                metadata: serde_json::json!({ "exchange": liq.exchange }),
            });
        }
    }

    let mut clusters: HashMap<(String, crate::types::Side, i64), (Decimal, DateTime<Utc>, Decimal)> =
        HashMap::new();
    for liq in &liquidations {
        let window = liq.time.timestamp() / 60;
        let entry = clusters
            .entry((liq.symbol.clone(), liq.side, window))
            .or_insert((Decimal::ZERO, liq.time, liq.price));
        entry.0 += liq.value_usd;
        entry.1 = liq.time;
        entry.2 = liq.price;
    }
    for ((symbol, side, _window), (total, time, price)) in clusters {
        if total >= thresholds.liquidation_cluster_usd {
            out.push(MarketSignal {
                time,
                symbol,
                signal_type: SignalType::LiquidationCluster,
                side: if side == crate::types::Side::Sell {
                    SignalSide::Bearish
                } else {
                    SignalSide::Bullish
                },
                severity: severity_for_ratio(total / thresholds.liquidation_cluster_usd),
                price_at_signal: Some(price),
                message: format!("1-minute liquidation cluster {total} exceeds {}", thresholds.liquidation_cluster_usd),
                metadata: serde_json::Value::Null,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{Liquidation, MetricPoint, Side};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn funding_extreme_fires_above_threshold() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        storage
            .upsert_metric_batch(
                market,
                "funding_rate",
                &[MetricPoint {
                    time: Utc.timestamp_opt(60, 0).unwrap(),
                    name: "funding_rate".to_string(),
                    value: dec!(0.001),
                    metadata: serde_json::Value::Null,
                }],
            )
            .unwrap();
        let thresholds = SignalThresholds::default();
        let signal = detect_funding_extreme(&storage, market, "BTCUSDT", &thresholds)
            .unwrap()
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::FundingExtreme);
        assert_eq!(signal.side, SignalSide::Bearish);
    }

    #[test]
    fn funding_within_threshold_is_silent() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        storage
            .upsert_metric_batch(
                market,
                "funding_rate",
                &[MetricPoint {
                    time: Utc.timestamp_opt(60, 0).unwrap(),
                    name: "funding_rate".to_string(),
                    value: dec!(0.0001),
                    metadata: serde_json::Value::Null,
                }],
            )
            .unwrap();
        let thresholds = SignalThresholds::default();
        assert!(detect_funding_extreme(&storage, market, "BTCUSDT", &thresholds)
            .unwrap()
            .is_none());
    }

    #[test]
    fn oi_spike_requires_close_samples() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        let far_apart = vec![
            MetricPoint {
                time: Utc.timestamp_opt(0, 0).unwrap(),
                name: "open_interest".to_string(),
                value: dec!(1000),
                metadata: serde_json::Value::Null,
            },
            MetricPoint {
                time: Utc.timestamp_opt(86_400, 0).unwrap(),
                name: "open_interest".to_string(),
                value: dec!(2000),
                metadata: serde_json::Value::Null,
            },
        ];
        storage.upsert_metric_batch(market, "open_interest", &far_apart).unwrap();
        let thresholds = SignalThresholds::default();
        assert!(detect_oi_spike(&storage, market, "BTCUSDT", &thresholds)
            .unwrap()
            .is_none());
    }

    #[test]
    fn whale_liquidation_detected_over_threshold() {
        let storage = Storage::open_memory().unwrap();
        storage
            .insert_liquidations_batch(&[Liquidation {
                time: Utc::now(),
                exchange: "binance".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Sell,
                price: dec!(50000),
                quantity: dec!(20),
                value_usd: dec!(1_000_000),
            }])
            .unwrap();
        let thresholds = SignalThresholds::default();
        let signals = detect_liquidation_signals(&storage, Utc::now(), &thresholds).unwrap();
        assert!(signals
            .iter()
            .any(|s| s.signal_type == SignalType::WhaleLiquidation));
    }
}
