//! Illustrative real connector: Binance-style REST OHLCV over `reqwest`.
//!
//! This is the one concrete non-mock adapter this crate ships (§4.C2); it
//! is not a connector catalog. Grounded on the response shape used across
//! the original `collector-py` exchange adapters (`[open_time, open, high,
//! low, close, volume, ...]` kline arrays) and on the reference backend's
//! `reqwest` client construction in `scrapers/binance_price_feed.rs`.

use super::{Connector, FetchError, FetchErrorKind, FetchMetadata};
use crate::types::{OhlcvBar, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

pub struct BinanceRestConnector {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRestConnector {
    pub fn new() -> Self {
        Self::with_base_url("https://api.binance.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder never fails for this config");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> FetchErrorKind {
        if status.as_u16() == 429 || status.as_u16() == 418 {
            FetchErrorKind::RateLimit
        } else if status.is_server_error() {
            FetchErrorKind::Server5xx
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            FetchErrorKind::Auth
        } else {
            FetchErrorKind::BadRequest
        }
    }
}

impl Default for BinanceRestConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for BinanceRestConnector {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<(Vec<OhlcvBar>, FetchMetadata), FetchError> {
        let interval = match timeframe {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
        };

        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", since.timestamp_millis().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::new(FetchErrorKind::Timeout, e.to_string())
                } else {
                    FetchError::new(FetchErrorKind::Network, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let kind = Self::classify_status(status);
            return Err(FetchError {
                kind,
                source_status: Some(status.as_u16()),
                message: format!("binance klines returned {status}"),
                retry_after,
            });
        }

        let raw: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Parse, e.to_string()))?;

        let mut bars = Vec::with_capacity(raw.len());
        for row in raw {
            bars.push(parse_kline_row(&row)?);
        }
        Ok((bars, FetchMetadata::default()))
    }

    async fn get_markets(&self) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Network, e.to_string()))?;
        if !response.status().is_success() {
            let kind = Self::classify_status(response.status());
            return Err(FetchError::new(kind, "exchangeInfo request failed"));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Parse, e.to_string()))?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| FetchError::new(FetchErrorKind::Parse, "missing symbols array"))?;
        Ok(symbols
            .iter()
            .filter_map(|s| s.get("symbol").and_then(|v| v.as_str()).map(String::from))
            .collect())
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Result<OhlcvBar, FetchError> {
    if row.len() < 6 {
        return Err(FetchError::new(
            FetchErrorKind::Parse,
            "kline row shorter than 6 fields",
        ));
    }
    let open_time_ms = row[0]
        .as_i64()
        .ok_or_else(|| FetchError::new(FetchErrorKind::Parse, "open_time not an integer"))?;
    let bucket_start_time = DateTime::<Utc>::from_timestamp_millis(open_time_ms)
        .ok_or_else(|| FetchError::new(FetchErrorKind::Parse, "open_time out of range"))?;

    let decimal_field = |v: &serde_json::Value, field: &str| -> Result<Decimal, FetchError> {
        let s = v
            .as_str()
            .ok_or_else(|| FetchError::new(FetchErrorKind::Parse, format!("{field} not a string")))?;
        Decimal::from_str(s)
            .map_err(|e| FetchError::new(FetchErrorKind::Parse, format!("{field}: {e}")))
    };

    Ok(OhlcvBar {
        bucket_start_time,
        open: decimal_field(&row[1], "open")?,
        high: decimal_field(&row[2], "high")?,
        low: decimal_field(&row[3], "low")?,
        close: decimal_field(&row[4], "close")?,
        volume: decimal_field(&row[5], "volume")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_kline_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1672531200000, "100.0", "110.0", "95.0", "105.0", "12.3", 1672531259999, "0", 0, "0", "0", "0"]"#,
        )
        .unwrap();
        let bar = parse_kline_row(&row).unwrap();
        assert_eq!(bar.open, Decimal::from_str("100.0").unwrap());
        assert!(bar.is_consistent());
    }

    #[test]
    fn rejects_short_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str(r#"[1, "2"]"#).unwrap();
        let err = parse_kline_row(&row).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Parse);
    }

    #[test]
    fn classifies_status_codes() {
        assert_eq!(
            BinanceRestConnector::classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            FetchErrorKind::RateLimit
        );
        assert_eq!(
            BinanceRestConnector::classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            FetchErrorKind::Server5xx
        );
        assert_eq!(
            BinanceRestConnector::classify_status(reqwest::StatusCode::UNAUTHORIZED),
            FetchErrorKind::Auth
        );
    }
}
