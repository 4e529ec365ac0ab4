//! Validator (§4.C4).
//!
//! Stateless with respect to persisted data: operates purely on an
//! in-memory bar sequence and never mutates or drops rows, only reports.
//! Batch and streaming modes share the exact same checks and report shape;
//! streaming keeps only the trailing `window_size` bars plus one prior bar
//! in memory, mirroring the reference backend's single-pass indicator
//! windows in `performance/metrics.rs`.

use crate::types::OhlcvBar;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

/// The five `validation_type` label values (§4.C4, §6, §8 S4) — also the
/// discriminant of each report entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    OutOfOrderTimestamp,
    DuplicateBar,
    PriceJump,
    VolumeSpike,
    MissingInterval,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::OutOfOrderTimestamp => "out_of_order_timestamp",
            IssueKind::DuplicateBar => "duplicate_bar",
            IssueKind::PriceJump => "price_jump",
            IssueKind::VolumeSpike => "volume_spike",
            IssueKind::MissingInterval => "missing_interval",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub index: usize,
    pub detail: String,
}

/// Batch/stream validation outcome. `valid` is false iff any error-severity
/// issue is present; warnings never flip it.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub total_records: usize,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationReport {
    fn empty(total_records: usize) -> Self {
        Self {
            valid: true,
            total_records,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push_error(&mut self, kind: IssueKind, index: usize, detail: String) {
        self.valid = false;
        self.errors.push(Issue { kind, index, detail });
    }

    fn push_warning(&mut self, kind: IssueKind, index: usize, detail: String) {
        self.warnings.push(Issue { kind, index, detail });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy {
    pub price_jump_threshold: Decimal,
    pub volume_spike_multiplier: Decimal,
    pub expected_interval_secs: i64,
}

const VOLUME_WINDOW: usize = 20;

/// Full sequence in memory (§4.C4 "Batch").
pub fn validate_ohlcv_batch(bars: &[OhlcvBar], policy: &ValidationPolicy) -> ValidationReport {
    let mut report = ValidationReport::empty(bars.len());
    let mut volume_window: VecDeque<Decimal> = VecDeque::with_capacity(VOLUME_WINDOW);
    let mut seen = std::collections::HashSet::new();

    for (i, bar) in bars.iter().enumerate() {
        check_bar(&mut report, bars, i, bar, policy, &mut volume_window, &mut seen);
    }
    report
}

/// Single-pass, O(window_size) memory (§4.C4 "Streaming"). Identical
/// semantics and report shape to `validate_ohlcv_batch`; callers feed bars
/// one at a time instead of holding the full sequence.
pub struct StreamValidator {
    policy: ValidationPolicy,
    prior_bar: Option<OhlcvBar>,
    volume_window: VecDeque<Decimal>,
    seen: std::collections::HashSet<i64>,
    index: usize,
    report: ValidationReport,
}

impl StreamValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            policy,
            prior_bar: None,
            volume_window: VecDeque::with_capacity(VOLUME_WINDOW),
            seen: std::collections::HashSet::new(),
            index: 0,
            report: ValidationReport::empty(0),
        }
    }

    pub fn push(&mut self, bar: &OhlcvBar) {
        self.report.total_records += 1;
        let idx = self.index;
        self.index += 1;

        let ts = bar.bucket_start_time.timestamp();
        if !self.seen.insert(ts) {
            self.report.push_error(
                IssueKind::DuplicateBar,
                idx,
                format!("duplicate bucket_start_time {ts}"),
            );
        }

        if let Some(prior) = &self.prior_bar {
            check_order_and_gap(&mut self.report, idx, prior, bar, &self.policy);
            check_price_jump(&mut self.report, idx, prior, bar, &self.policy);
        }
        check_volume_spike(&mut self.report, idx, bar, &self.policy, &mut self.volume_window);

        self.prior_bar = Some(bar.clone());
    }

    pub fn finish(self) -> ValidationReport {
        self.report
    }
}

/// Same semantics as `StreamValidator` pushed over a full slice, kept for
/// callers that already have the full sequence but want to exercise the
/// streaming code path (used in tests to assert S4's "identical report
/// shape" property).
pub fn validate_ohlcv_stream(bars: &[OhlcvBar], policy: &ValidationPolicy) -> ValidationReport {
    let mut validator = StreamValidator::new(*policy);
    for bar in bars {
        validator.push(bar);
    }
    validator.finish()
}

fn check_bar(
    report: &mut ValidationReport,
    bars: &[OhlcvBar],
    i: usize,
    bar: &OhlcvBar,
    policy: &ValidationPolicy,
    volume_window: &mut VecDeque<Decimal>,
    seen: &mut std::collections::HashSet<i64>,
) {
    let ts = bar.bucket_start_time.timestamp();
    if !seen.insert(ts) {
        report.push_error(
            IssueKind::DuplicateBar,
            i,
            format!("duplicate bucket_start_time {ts}"),
        );
    }
    if i > 0 {
        check_order_and_gap(report, i, &bars[i - 1], bar, policy);
        check_price_jump(report, i, &bars[i - 1], bar, policy);
    }
    check_volume_spike(report, i, bar, policy, volume_window);
}

fn check_order_and_gap(
    report: &mut ValidationReport,
    i: usize,
    prior: &OhlcvBar,
    bar: &OhlcvBar,
    policy: &ValidationPolicy,
) {
    let prior_ts = prior.bucket_start_time.timestamp();
    let ts = bar.bucket_start_time.timestamp();

    if ts <= prior_ts {
        report.push_error(
            IssueKind::OutOfOrderTimestamp,
            i,
            format!("ts {ts} <= previous ts {prior_ts}"),
        );
        return;
    }

    let delta = ts - prior_ts;
    let expected = policy.expected_interval_secs;
    if expected > 0 && delta as f64 > 1.5 * expected as f64 {
        let missing = delta / expected - 1;
        if missing > 0 {
            report.push_warning(
                IssueKind::MissingInterval,
                i,
                format!("gap of {delta}s implies {missing} missing bucket(s)"),
            );
        }
    }
}

fn check_price_jump(
    report: &mut ValidationReport,
    i: usize,
    prior: &OhlcvBar,
    bar: &OhlcvBar,
    policy: &ValidationPolicy,
) {
    if prior.close.is_zero() {
        return;
    }
    let change = ((bar.close - prior.close) / prior.close).abs();
    if change > policy.price_jump_threshold {
        report.push_warning(
            IssueKind::PriceJump,
            i,
            format!(
                "close moved {}% from {} to {}",
                (change * Decimal::ONE_HUNDRED).round_dp(2),
                prior.close,
                bar.close
            ),
        );
    }
}

fn check_volume_spike(
    report: &mut ValidationReport,
    i: usize,
    bar: &OhlcvBar,
    policy: &ValidationPolicy,
    window: &mut VecDeque<Decimal>,
) {
    if window.len() >= VOLUME_WINDOW {
        let mean = window.iter().sum::<Decimal>() / Decimal::from(window.len());
        if !mean.is_zero() {
            let ratio = bar.volume / mean;
            if ratio > policy.volume_spike_multiplier {
                report.push_warning(
                    IssueKind::VolumeSpike,
                    i,
                    format!(
                        "volume {} is {}x the {}-bar rolling mean {}",
                        bar.volume,
                        ratio.round_dp(2),
                        VOLUME_WINDOW,
                        mean.round_dp(4)
                    ),
                );
            }
        }
    }
    window.push_back(bar.volume);
    if window.len() > VOLUME_WINDOW {
        window.pop_front();
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            price_jump_threshold: Decimal::new(10, 2),
            volume_spike_multiplier: Decimal::from(5),
            expected_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn bar_at(seconds: i64, close: Decimal, volume: Decimal) -> OhlcvBar {
        OhlcvBar {
            bucket_start_time: DateTime::<Utc>::from_timestamp(seconds, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn flags_out_of_order_as_error() {
        let bars = vec![
            bar_at(120, dec!(100), dec!(1)),
            bar_at(60, dec!(101), dec!(1)),
        ];
        let report = validate_ohlcv_batch(&bars, &ValidationPolicy::default());
        assert!(!report.valid);
        assert_eq!(report.errors[0].kind, IssueKind::OutOfOrderTimestamp);
    }

    #[test]
    fn flags_duplicate_bucket_as_error() {
        let bars = vec![
            bar_at(60, dec!(100), dec!(1)),
            bar_at(120, dec!(101), dec!(1)),
            bar_at(120, dec!(101), dec!(1)),
        ];
        let report = validate_ohlcv_batch(&bars, &ValidationPolicy::default());
        assert!(!report.valid); // grouped with monotonicity (§7), not a warning
        assert!(report
            .errors
            .iter()
            .any(|w| w.kind == IssueKind::DuplicateBar));
    }

    #[test]
    fn flags_price_jump_over_threshold() {
        let bars = vec![
            bar_at(60, dec!(100), dec!(1)),
            bar_at(120, dec!(120), dec!(1)), // +20% > 10% default
        ];
        let report = validate_ohlcv_batch(&bars, &ValidationPolicy::default());
        assert!(report.warnings.iter().any(|w| w.kind == IssueKind::PriceJump));
    }

    #[test]
    fn flags_volume_spike_after_window_fills() {
        let mut bars: Vec<OhlcvBar> = (0..20)
            .map(|i| bar_at(60 * (i + 1), dec!(100), dec!(1)))
            .collect();
        bars.push(bar_at(60 * 21, dec!(100), dec!(10))); // 10x > 5x default
        let report = validate_ohlcv_batch(&bars, &ValidationPolicy::default());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == IssueKind::VolumeSpike));
    }

    #[test]
    fn flags_missing_interval() {
        let bars = vec![
            bar_at(60, dec!(100), dec!(1)),
            bar_at(60 * 5, dec!(100), dec!(1)), // 4 buckets late, expected=60s
        ];
        let policy = ValidationPolicy {
            expected_interval_secs: 60,
            ..Default::default()
        };
        let report = validate_ohlcv_batch(&bars, &policy);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == IssueKind::MissingInterval));
    }

    #[test]
    fn batch_and_stream_agree() {
        let bars = vec![
            bar_at(60, dec!(100), dec!(1)),
            bar_at(120, dec!(130), dec!(1)),
            bar_at(120, dec!(130), dec!(1)),
        ];
        let policy = ValidationPolicy::default();
        let batch = validate_ohlcv_batch(&bars, &policy);
        let stream = validate_ohlcv_stream(&bars, &policy);
        assert_eq!(batch.valid, stream.valid);
        assert_eq!(batch.errors.len(), stream.errors.len());
        assert_eq!(batch.warnings.len(), stream.warnings.len());
    }
}
