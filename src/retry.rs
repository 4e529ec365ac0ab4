//! Retry/Rate-Limit Policy (§4.C5).
//!
//! Wraps every connector call with exponential backoff + jitter, honors
//! `Retry-After` on RATE_LIMIT errors by pausing the whole source adapter,
//! and emits the request/duration/error metrics named in §6. The
//! per-source token gate is grounded on `middleware/rate_limit.rs`'s
//! window-based counter, turned outbound: one `SourceLimiter` per
//! `source_name`, shared across every connector call for that source.

use crate::connector::{Connector, FetchError, FetchErrorKind, FetchMetadata};
use crate::types::{OhlcvBar, Timeframe};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter_pct: 0.20,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-indexed): `initial * factor^(n-1)`,
    /// capped at `max_backoff`, jittered by ±`jitter_pct`.
    fn delay_for_attempt(&self, n: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(n as i32 - 1);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(-self.jitter_pct..=self.jitter_pct);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Per-source rate gate + RATE_LIMIT pause window. One instance is shared
/// by every call against a given `source_name`.
pub struct SourceLimiter {
    /// Requests per second; `None` is unbounded.
    rate_limit: Option<f64>,
    last_request: Mutex<Option<Instant>>,
    /// Unix seconds until which this source is paused after a RATE_LIMIT
    /// response; 0 means not paused.
    paused_until: AtomicI64,
    consecutive_failures: AtomicU32,
}

impl SourceLimiter {
    pub fn new(rate_limit: Option<f64>) -> Self {
        Self {
            rate_limit,
            last_request: Mutex::new(None),
            paused_until: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> Option<Duration> {
        let until = self.paused_until.load(Ordering::SeqCst);
        if until == 0 {
            return None;
        }
        let now = Utc::now().timestamp();
        if until > now {
            Some(Duration::from_secs((until - now) as u64))
        } else {
            None
        }
    }

    fn pause_for(&self, duration: Duration) {
        let until = Utc::now().timestamp() + duration.as_secs() as i64;
        self.paused_until.store(until, Ordering::SeqCst);
    }

    /// Blocks until the per-source request interval has elapsed.
    async fn acquire(&self) {
        let Some(rate) = self.rate_limit else { return };
        if rate <= 0.0 {
            return;
        }
        let min_interval = Duration::from_secs_f64(1.0 / rate);
        let wait = {
            let mut last = self.last_request.lock();
            let now = Instant::now();
            let wait = match *last {
                Some(prev) if now.duration_since(prev) < min_interval => {
                    Some(min_interval - now.duration_since(prev))
                }
                _ => None,
            };
            *last = Some(now);
            wait
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Outcome of a retried call, distinguishing cancellation from both
/// success and failure per §4.C5's "counts as neither" rule.
pub enum Outcome<T> {
    Success(T),
    Failed(FetchError),
    Cancelled,
}

/// Wraps any single connector call with the full retry/backoff/rate-limit
/// policy (§4.C5): `call` is re-invoked on each attempt, so it must be a
/// cheap closure over the actual connector method (e.g.
/// `|| connector.fetch_open_interest(symbol)`). `exchange`/`endpoint` are
/// metric labels only. Every cycle that dispatches to a connector goes
/// through this, not just OHLCV.
pub async fn with_retry<T, F, Fut>(
    exchange: &str,
    endpoint: &str,
    limiter: &SourceLimiter,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Outcome<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchError>>,
{
    if let Some(remaining) = limiter.is_paused() {
        warn!(exchange, "source paused after rate limit, waiting {remaining:?}");
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = cancel.cancelled() => return Outcome::Cancelled,
        }
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        limiter.acquire().await;

        let start = Instant::now();
        let result = tokio::select! {
            r = call() => r,
            _ = cancel.cancelled() => return Outcome::Cancelled,
        };
        let elapsed = start.elapsed();

        metrics::histogram!("collector_api_request_duration_seconds", "exchange" => exchange.to_string(), "endpoint" => endpoint.to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(value) => {
                metrics::counter!("collector_api_requests_total", "exchange" => exchange.to_string(), "endpoint" => endpoint.to_string(), "status" => "success")
                    .increment(1);
                limiter.consecutive_failures.store(0, Ordering::SeqCst);
                return Outcome::Success(value);
            }
            Err(err) => {
                metrics::counter!("collector_api_requests_total", "exchange" => exchange.to_string(), "endpoint" => endpoint.to_string(), "status" => "error")
                    .increment(1);
                metrics::counter!("collector_api_errors_total", "exchange" => exchange.to_string(), "endpoint" => endpoint.to_string(), "error_type" => err.kind.as_str())
                    .increment(1);

                if err.kind == FetchErrorKind::RateLimit {
                    let pause = err.retry_after.unwrap_or(Duration::from_secs(60));
                    limiter.pause_for(pause);
                }

                if !err.retryable() || attempt > policy.max_retries {
                    limiter.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    return Outcome::Failed(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                info!(exchange, attempt, ?delay, error = %err, "retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                }
            }
        }
    }
}

/// OHLCV-specific convenience over [`with_retry`]; also records the two
/// collection-health gauges that need the symbol/timeframe labels only
/// this path has (§6's `collector_consecutive_failures`,
/// `collector_last_successful_collection_timestamp`).
pub async fn fetch_ohlcv_with_retry(
    connector: &dyn Connector,
    limiter: &SourceLimiter,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    symbol: &str,
    timeframe: Timeframe,
    since: DateTime<Utc>,
    limit: u32,
) -> Outcome<(Vec<OhlcvBar>, FetchMetadata)> {
    let exchange = connector.name().to_string();
    let outcome = with_retry(&exchange, "fetch_ohlcv", limiter, policy, cancel, || {
        connector.fetch_ohlcv(symbol, timeframe, since, limit)
    })
    .await;

    match &outcome {
        Outcome::Success(_) => {
            crate::metrics::record_consecutive_failures(&exchange, symbol, timeframe.as_str(), 0);
            crate::metrics::record_last_successful_collection(&exchange, symbol, timeframe.as_str(), Utc::now());
        }
        Outcome::Failed(_) => {
            crate::metrics::record_consecutive_failures(
                &exchange,
                symbol,
                timeframe.as_str(),
                limiter.consecutive_failures() as u64,
            );
        }
        Outcome::Cancelled => {}
    }

    outcome
}

/// Convenience wrapper that bundles a limiter with the source name it
/// gates, so the orchestrator can hold one map of these per config.
pub struct RateLimitedSource {
    pub limiter: Arc<SourceLimiter>,
}

impl RateLimitedSource {
    pub fn new(rate_limit: Option<f64>) -> Self {
        Self {
            limiter: Arc::new(SourceLimiter::new(rate_limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_pct: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        let big = RetryPolicy {
            max_retries: 20,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter_pct: 0.0,
        };
        assert_eq!(big.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn rate_limit_error_pauses_source() {
        let mock = MockConnector::new("binance");
        mock.push_error(FetchError::rate_limit(Some(Duration::from_secs(30))));
        let limiter = SourceLimiter::new(None);
        let policy = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let outcome = fetch_ohlcv_with_retry(
            &mock,
            &limiter,
            &policy,
            &cancel,
            "BTCUSDT",
            Timeframe::OneMinute,
            Utc::now(),
            10,
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(limiter.is_paused().is_some());
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_failure() {
        let mock = MockConnector::new("binance");
        mock.push_error(FetchError::new(FetchErrorKind::Network, "boom"));
        let limiter = SourceLimiter::new(None);
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fetch_ohlcv_with_retry(
            &mock,
            &limiter,
            &policy,
            &cancel,
            "BTCUSDT",
            Timeframe::OneMinute,
            Utc::now(),
            10,
        )
        .await;
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let mock = MockConnector::new("binance");
        mock.push_error(FetchError::new(FetchErrorKind::Network, "boom"));
        mock.push_bars(vec![]);
        let limiter = SourceLimiter::new(None);
        let policy = RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let outcome = fetch_ohlcv_with_retry(
            &mock,
            &limiter,
            &policy,
            &cancel,
            "BTCUSDT",
            Timeframe::OneMinute,
            Utc::now(),
            10,
        )
        .await;
        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(limiter.consecutive_failures(), 0);
    }
}
