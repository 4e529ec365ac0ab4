//! Deterministic in-memory connector used by every test in §8. Behavior is
//! driven entirely by a scripted queue of responses so tests can assert
//! exact retry/backoff/validation outcomes without network flakiness.

use super::{Connector, FetchError, FetchMetadata};
use crate::types::{OhlcvBar, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// One scripted response to the next `fetch_ohlcv` call.
#[derive(Debug, Clone)]
pub enum ScriptedOhlcv {
    Bars(Vec<OhlcvBar>),
    Error(FetchError),
}

pub struct MockConnector {
    name: String,
    ohlcv_script: Mutex<VecDeque<ScriptedOhlcv>>,
    markets: Vec<String>,
}

impl MockConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ohlcv_script: Mutex::new(VecDeque::new()),
            markets: Vec::new(),
        }
    }

    pub fn with_markets(mut self, markets: Vec<String>) -> Self {
        self.markets = markets;
        self
    }

    /// Queue a response, returned in FIFO order on successive
    /// `fetch_ohlcv` calls. Once the queue drains, an empty batch is
    /// returned (matches §4.C2: "may be empty").
    pub fn push_ohlcv(&self, response: ScriptedOhlcv) {
        self.ohlcv_script.lock().push_back(response);
    }

    pub fn push_bars(&self, bars: Vec<OhlcvBar>) {
        self.push_ohlcv(ScriptedOhlcv::Bars(bars));
    }

    pub fn push_error(&self, err: FetchError) {
        self.push_ohlcv(ScriptedOhlcv::Error(err));
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _since: DateTime<Utc>,
        limit: u32,
    ) -> Result<(Vec<OhlcvBar>, FetchMetadata), FetchError> {
        let next = self.ohlcv_script.lock().pop_front();
        match next {
            None => Ok((Vec::new(), FetchMetadata::default())),
            Some(ScriptedOhlcv::Error(err)) => Err(err),
            Some(ScriptedOhlcv::Bars(mut bars)) => {
                bars.truncate(limit as usize);
                Ok((bars, FetchMetadata::default()))
            }
        }
    }

    async fn get_markets(&self) -> Result<Vec<String>, FetchError> {
        Ok(self.markets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::FetchErrorKind;
    use rust_decimal_macros::dec;

    fn bar(minute: i64) -> OhlcvBar {
        OhlcvBar {
            bucket_start_time: DateTime::from_timestamp(minute * 60, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12.3),
        }
    }

    #[tokio::test]
    async fn scripted_responses_play_in_order() {
        let mock = MockConnector::new("binance");
        mock.push_error(FetchError::rate_limit(None));
        mock.push_bars(vec![bar(0), bar(1)]);

        let err = mock
            .fetch_ohlcv("BTCUSDT", Timeframe::OneMinute, Utc::now(), 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RateLimit);

        let (bars, _) = mock
            .fetch_ohlcv("BTCUSDT", Timeframe::OneMinute, Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[tokio::test]
    async fn empty_queue_returns_empty_batch() {
        let mock = MockConnector::new("binance");
        let (bars, _) = mock
            .fetch_ohlcv("BTCUSDT", Timeframe::OneMinute, Utc::now(), 10)
            .await
            .unwrap();
        assert!(bars.is_empty());
    }
}
