//! Shared data-model types for the collection pipeline.
//!
//! These are the tagged unions the original Python system represents as
//! loosely-typed dicts (see DESIGN.md). Every timestamp in this module is
//! UTC; nothing here owns a database connection.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A market's instrument kind. Determines heuristic fallback in
/// `get_or_create_market` when the symbol registry has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    LinearPerpetual,
    InversePerpetual,
    Futures,
    Option,
}

impl MarketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(MarketType::Spot),
            "linear_perpetual" => Some(MarketType::LinearPerpetual),
            "inverse_perpetual" => Some(MarketType::InversePerpetual),
            "futures" => Some(MarketType::Futures),
            "option" => Some(MarketType::Option),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketType::Spot => "spot",
            MarketType::LinearPerpetual => "linear_perpetual",
            MarketType::InversePerpetual => "inverse_perpetual",
            MarketType::Futures => "futures",
            MarketType::Option => "option",
        };
        f.write_str(s)
    }
}

/// OHLCV timeframe. Only `OneMinute` (and whatever coarse timeframes a
/// config declares as primary) are ever written by the orchestrator; the
/// rest are read-only continuous-aggregate views (§4.C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::OneMinute),
            "5m" => Some(Timeframe::FiveMinutes),
            "15m" => Some(Timeframe::FifteenMinutes),
            "1h" => Some(Timeframe::OneHour),
            "1d" => Some(Timeframe::OneDay),
            _ => None,
        }
    }

    /// Bucket width. Used to align bucket_start_time and to compute
    /// missing-interval gaps (§4.C4, §4.C6).
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Timeframe::OneMinute => chrono::Duration::minutes(1),
            Timeframe::FiveMinutes => chrono::Duration::minutes(5),
            Timeframe::FifteenMinutes => chrono::Duration::minutes(15),
            Timeframe::OneHour => chrono::Duration::hours(1),
            Timeframe::OneDay => chrono::Duration::days(1),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV observation. Invariants (§3): low <= open <= high, low <= close
/// <= high, volume >= 0, bucket_start_time aligned to the timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub bucket_start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl OhlcvBar {
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= Decimal::ZERO
    }
}

/// A named market_metrics point, e.g. funding_rate, open_interest, obi.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub time: DateTime<Utc>,
    pub name: String,
    pub value: Decimal,
    pub metadata: serde_json::Value,
}

/// Category for a global_indicators row (fear/greed, ETF flow, macro release).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorCategory {
    Sentiment,
    Etf,
    Macro,
}

impl fmt::Display for IndicatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndicatorCategory::Sentiment => "sentiment",
            IndicatorCategory::Etf => "etf",
            IndicatorCategory::Macro => "macro",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalIndicator {
    pub time: DateTime<Utc>,
    pub category: IndicatorCategory,
    pub name: String,
    pub value: Decimal,
    pub classification: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxDirection {
    Inflow,
    Outflow,
    Neutral,
}

impl fmt::Display for TxDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxDirection::Inflow => "inflow",
            TxDirection::Outflow => "outflow",
            TxDirection::Neutral => "neutral",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleTransaction {
    pub blockchain: String,
    pub tx_hash: String,
    pub time: DateTime<Utc>,
    pub amount: Decimal,
    pub amount_usd: Option<Decimal>,
    pub direction: TxDirection,
    pub is_whale: bool,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub time: DateTime<Utc>,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub value_usd: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub time: DateTime<Utc>,
    pub trade_id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
}

/// Signal direction. `neutral` exists in the model but C9's detector
/// catalog (§4.C9) only ever emits bullish/bearish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalSide::Bullish => "bullish",
            SignalSide::Bearish => "bearish",
            SignalSide::Neutral => "neutral",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

/// The detector catalog in §4.C9. `as_str` values are the `signal_type`
/// column and appear verbatim in `market_signals` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    FundingExtreme,
    OiSpike,
    WhaleLiquidation,
    LiquidationCluster,
    ObiExtreme,
    CvdDivergence,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::FundingExtreme => "funding_extreme",
            SignalType::OiSpike => "oi_spike",
            SignalType::WhaleLiquidation => "whale_liquidation",
            SignalType::LiquidationCluster => "liquidation_cluster",
            SignalType::ObiExtreme => "obi_extreme",
            SignalType::CvdDivergence => "cvd_divergence",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSignal {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub signal_type: SignalType,
    pub side: SignalSide,
    pub severity: Severity,
    pub price_at_signal: Option<Decimal>,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Backfill task state machine (§4.C6). Transitions: pending -> running ->
/// {completed, failed}; failed -> pending (retry_count < max_retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillDataType {
    Ohlcv,
    Trades,
    Orderbook,
}

impl BackfillDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillDataType::Ohlcv => "ohlcv",
            BackfillDataType::Trades => "trades",
            BackfillDataType::Orderbook => "orderbook",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillTask {
    pub id: i64,
    pub market_id: i64,
    pub data_type: BackfillDataType,
    pub timeframe: Option<Timeframe>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub expected_records: Option<i64>,
    pub actual_records: Option<i64>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One contiguous run of missing buckets, as detected by
/// `Storage::count_missing_buckets` / `backfill::detect_gaps`.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub missing_count: i64,
}

/// A registered market (the static registry of §3).
#[derive(Debug, Clone)]
pub struct Market {
    pub id: i64,
    pub exchange: String,
    pub symbol: String,
    pub market_type: MarketType,
    pub is_active: bool,
}
