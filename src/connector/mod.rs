//! Connector interface (§4.C2): the uniform contract every source adapter
//! satisfies. The orchestrator dispatches by `DataType` and wraps every
//! call with the retry policy (C5).
//!
//! Grounded on the reference backend's scraper modules (each implements
//! only the subset of market-data operations its source supports) and on
//! `collector-py`'s connector family, which this spec's §4.C2 distills.

pub mod binance;
pub mod mock;

use crate::types::{OhlcvBar, Timeframe, WhaleTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Declaration-level data type a collector config targets (§4.C1).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataType {
    Ohlcv { timeframe: Timeframe },
    FundingRate,
    OpenInterest,
    WhaleTx,
    EtfFlow,
    EventCalendar,
    SentimentIndex,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Ohlcv { timeframe } => write!(f, "ohlcv:{timeframe}"),
            DataType::FundingRate => write!(f, "funding_rate"),
            DataType::OpenInterest => write!(f, "open_interest"),
            DataType::WhaleTx => write!(f, "whale_tx"),
            DataType::EtfFlow => write!(f, "etf_flow"),
            DataType::EventCalendar => write!(f, "event_calendar"),
            DataType::SentimentIndex => write!(f, "sentiment_index"),
        }
    }
}

/// Error kind taxonomy (§4.C2). Retryable kinds are NETWORK, TIMEOUT,
/// RATE_LIMIT, SERVER_5XX; AUTH and PARSE are fatal for that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Timeout,
    RateLimit,
    Server5xx,
    BadRequest,
    Auth,
    Parse,
    Empty,
}

impl FetchErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::Network
                | FetchErrorKind::Timeout
                | FetchErrorKind::RateLimit
                | FetchErrorKind::Server5xx
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network => "network",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::RateLimit => "rate_limit",
            FetchErrorKind::Server5xx => "server_5xx",
            FetchErrorKind::BadRequest => "bad_request",
            FetchErrorKind::Auth => "auth",
            FetchErrorKind::Parse => "parse",
            FetchErrorKind::Empty => "empty",
        }
    }
}

/// Typed error every connector operation surfaces on failure (§4.C2).
#[derive(Debug, Clone, thiserror::Error)]
#[error("fetch error ({kind:?}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub source_status: Option<u16>,
    pub message: String,
    /// Present only on RATE_LIMIT responses that surfaced a `Retry-After`
    /// header; honored by the retry policy (§4.C5).
    pub retry_after: Option<std::time::Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            source_status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limit(retry_after: Option<std::time::Duration>) -> Self {
        Self {
            kind: FetchErrorKind::RateLimit,
            source_status: Some(429),
            message: "rate limited".to_string(),
            retry_after,
        }
    }

    pub fn unsupported(op: &str) -> Self {
        Self::new(
            FetchErrorKind::BadRequest,
            format!("operation unsupported by this connector: {op}"),
        )
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Out-of-band information returned alongside every fetched batch: the
/// source's own cursor/timestamp and any rate-limit headers it surfaced.
#[derive(Debug, Clone, Default)]
pub struct FetchMetadata {
    pub server_time: Option<DateTime<Utc>>,
    pub rate_limit_remaining: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FundingPoint {
    pub time: DateTime<Utc>,
    pub funding_rate: rust_decimal::Decimal,
    pub mark_price: Option<rust_decimal::Decimal>,
}

#[derive(Debug, Clone)]
pub struct OpenInterestPoint {
    pub time: DateTime<Utc>,
    pub open_interest: rust_decimal::Decimal,
    pub open_interest_usd: Option<rust_decimal::Decimal>,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    pub name: String,
    pub importance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EtfFlowRecord {
    pub time: DateTime<Utc>,
    pub product_code: String,
    pub net_flow_usd: rust_decimal::Decimal,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SentimentPoint {
    pub time: DateTime<Utc>,
    pub value: rust_decimal::Decimal,
    pub classification: Option<String>,
}

/// Every source adapter implements the subset of these it supports;
/// unimplemented operations fall back to the default `BAD_REQUEST` body
/// rather than forcing every adapter to hand-write a stub (§4.C2).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable name used in metric labels and config `source_name` lookups.
    fn name(&self) -> &str;

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _since: DateTime<Utc>,
        _limit: u32,
    ) -> Result<(Vec<OhlcvBar>, FetchMetadata), FetchError> {
        Err(FetchError::unsupported("fetch_ohlcv"))
    }

    async fn fetch_latest_funding(
        &self,
        _symbol: &str,
    ) -> Result<Option<FundingPoint>, FetchError> {
        Err(FetchError::unsupported("fetch_latest_funding"))
    }

    async fn fetch_open_interest(
        &self,
        _symbol: &str,
    ) -> Result<Option<OpenInterestPoint>, FetchError> {
        Err(FetchError::unsupported("fetch_open_interest"))
    }

    async fn fetch_whale_transactions(
        &self,
        _address: Option<&str>,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
        _limit: u32,
    ) -> Result<Vec<WhaleTransaction>, FetchError> {
        Err(FetchError::unsupported("fetch_whale_transactions"))
    }

    async fn fetch_etf_flows(
        &self,
        _asset: &str,
        _lookback_days: u32,
    ) -> Result<Vec<EtfFlowRecord>, FetchError> {
        Err(FetchError::unsupported("fetch_etf_flows"))
    }

    async fn fetch_event_calendar(
        &self,
        _lookback_months_ahead: u32,
    ) -> Result<Vec<EventRecord>, FetchError> {
        Err(FetchError::unsupported("fetch_event_calendar"))
    }

    async fn get_markets(&self) -> Result<Vec<String>, FetchError> {
        Err(FetchError::unsupported("get_markets"))
    }

    /// Known large-holder addresses for a chain (§4.C8's `rich_list_collect`).
    async fn fetch_rich_list_addresses(&self, _blockchain: &str) -> Result<Vec<String>, FetchError> {
        Err(FetchError::unsupported("fetch_rich_list_addresses"))
    }

    /// Market-sentiment index, e.g. fear/greed (§4.C8's `fear_greed_collect`).
    async fn fetch_sentiment_index(&self) -> Result<Option<SentimentPoint>, FetchError> {
        Err(FetchError::unsupported("fetch_sentiment_index"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec() {
        assert!(FetchErrorKind::Network.is_retryable());
        assert!(FetchErrorKind::Timeout.is_retryable());
        assert!(FetchErrorKind::RateLimit.is_retryable());
        assert!(FetchErrorKind::Server5xx.is_retryable());
        assert!(!FetchErrorKind::Auth.is_retryable());
        assert!(!FetchErrorKind::Parse.is_retryable());
        assert!(!FetchErrorKind::BadRequest.is_retryable());
        assert!(!FetchErrorKind::Empty.is_retryable());
    }

    #[test]
    fn data_type_display() {
        assert_eq!(
            DataType::Ohlcv {
                timeframe: Timeframe::OneMinute
            }
            .to_string(),
            "ohlcv:1m"
        );
        assert_eq!(DataType::FundingRate.to_string(), "funding_rate");
    }
}
