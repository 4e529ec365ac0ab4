//! Cron-like Scheduler (§4.C8).
//!
//! Accepts jobs registered as `(job_id, cadence, handler)` and fires them
//! with coalescing, at-most-one-live-execution, and misfire grace. The
//! cron matcher is a direct port of `collector-py`'s
//! `_cron_matches_now`/`_cron_field_matches`/`_cron_token_matches`
//! (`main.py`), chosen over an external cron crate so the day-of-week
//! 0/7-both-mean-Sunday normalization and exact token grammar match the
//! original bit-for-bit (§8 property 5).

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// A 5-field cron expression, pre-validated at construction so invalid
/// schedules fail fast at config-load time rather than at first fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: String,
    hour: String,
    day_of_month: String,
    month: String,
    day_of_week: String,
}

/// Cadence forms a job can be registered with (§4.C8).
#[derive(Debug, Clone)]
pub enum Cadence {
    Interval(Duration),
    Cron(CronExpr),
    CronTz(CronExpr, Tz),
}

impl Cadence {
    pub fn interval_secs(secs: u64) -> Self {
        Cadence::Interval(Duration::from_secs(secs))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        Ok(Cadence::Cron(Self::parse_cron(expr)?))
    }

    pub fn cron_tz(expr: &str, tz: Tz) -> Result<Self> {
        Ok(Cadence::CronTz(Self::parse_cron(expr)?, tz))
    }

    pub fn parse_cron(expr: &str) -> Result<CronExpr> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            bail!(
                "cron expression must have exactly 5 fields, got {}: '{}'",
                parts.len(),
                expr
            );
        }
        let cron = CronExpr {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day_of_month: parts[2].to_string(),
            month: parts[3].to_string(),
            day_of_week: parts[4].to_string(),
        };
        // Validate every field against a sample instant so malformed
        // tokens (non-numeric, zero step, reversed range) fail now.
        cron_matches(&cron, Utc::now())
            .map_err(|e| anyhow!("invalid cron expression '{expr}': {e}"))?;
        Ok(cron)
    }
}

/// §4.C8: minute, hour, day-of-month, month are checked against the naive
/// field matcher; day-of-week uses cron's Sunday=0 convention where the
/// original Python computes `(now.weekday() + 1) % 7` (Python
/// Monday=0 -> cron Sunday=0).
pub fn cron_matches(cron: &CronExpr, now: DateTime<Utc>) -> Result<bool> {
    let cron_weekday = (now.weekday().num_days_from_monday() as i64 + 1) % 7;
    Ok(field_matches(&cron.minute, now.minute() as i64, 0, 59, false)?
        && field_matches(&cron.hour, now.hour() as i64, 0, 23, false)?
        && field_matches(&cron.day_of_month, now.day() as i64, 1, 31, false)?
        && field_matches(&cron.month, now.month() as i64, 1, 12, false)?
        && field_matches(&cron.day_of_week, cron_weekday, 0, 7, true)?)
}

/// Cron in a named IANA zone: convert `now` into that zone's wall clock
/// before matching fields (§4.C8's "interpret the cron in a named zone").
pub fn cron_matches_tz(cron: &CronExpr, now: DateTime<Utc>, tz: Tz) -> Result<bool> {
    let local = now.with_timezone(&tz);
    let cron_weekday = (local.weekday().num_days_from_monday() as i64 + 1) % 7;
    Ok(field_matches(&cron.minute, local.minute() as i64, 0, 59, false)?
        && field_matches(&cron.hour, local.hour() as i64, 0, 23, false)?
        && field_matches(&cron.day_of_month, local.day() as i64, 1, 31, false)?
        && field_matches(&cron.month, local.month() as i64, 1, 12, false)?
        && field_matches(&cron.day_of_week, cron_weekday, 0, 7, true)?)
}

fn field_matches(
    field: &str,
    value: i64,
    min_value: i64,
    max_value: i64,
    is_day_of_week: bool,
) -> Result<bool> {
    for token in field.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token_matches(token, value, min_value, max_value, is_day_of_week)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn normalize_dow(num: i64, is_day_of_week: bool) -> i64 {
    if is_day_of_week && num == 7 {
        0
    } else {
        num
    }
}

fn token_matches(
    token: &str,
    value: i64,
    min_value: i64,
    max_value: i64,
    is_day_of_week: bool,
) -> Result<bool> {
    if token == "*" {
        return Ok(true);
    }

    let (range_part, step) = if let Some((range_part, step_part)) = token.split_once('/') {
        let step: i64 = step_part
            .parse()
            .map_err(|_| anyhow!("invalid step in cron token '{token}'"))?;
        if step <= 0 {
            bail!("cron step must be positive in token '{token}'");
        }
        (range_part, step)
    } else {
        (token, 1)
    };

    let (start, end) = if range_part == "*" {
        (min_value, max_value)
    } else if let Some((start_s, end_s)) = range_part.split_once('-') {
        let start: i64 = start_s
            .parse()
            .map_err(|_| anyhow!("invalid range start in cron token '{token}'"))?;
        let end: i64 = end_s
            .parse()
            .map_err(|_| anyhow!("invalid range end in cron token '{token}'"))?;
        (start, end)
    } else {
        let target: i64 = range_part
            .parse()
            .map_err(|_| anyhow!("invalid cron token '{token}'"))?;
        let target = normalize_dow(target, is_day_of_week);
        return Ok(value == target);
    };

    let start = normalize_dow(start, is_day_of_week);
    let end = normalize_dow(end, is_day_of_week);

    if start < min_value || end > max_value {
        bail!("cron token '{token}' out of range [{min_value}, {max_value}]");
    }
    if start > end {
        bail!("cron token '{token}' has start > end");
    }
    if value < start || value > end {
        return Ok(false);
    }
    Ok((value - start) % step == 0)
}

/// Per-job defaults (§4.C8): coalesce missed fires, cap concurrency at
/// one live execution, tolerate a pause of up to `misfire_grace` before
/// giving up on a missed fire.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub misfire_grace: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            misfire_grace: Duration::from_secs(3600),
        }
    }
}

fn minute_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    let bucket = now.date_naive().and_hms_opt(now.hour(), now.minute(), 0).unwrap();
    DateTime::<Utc>::from_naive_utc_and_offset(bucket, Utc)
}

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    id: String,
    cadence: Cadence,
    handler: JobHandler,
    /// Guards "at most one live execution per job_id" (§4.C8, §8 property
    /// 7): a tick that finds this `true` is coalesced into a no-op.
    running: Arc<AtomicBool>,
}

/// Records of the last run outcome per job, read by the metrics surface
/// (`collector_scheduler_job_*`, §6).
#[derive(Debug, Clone, Default)]
pub struct JobRunRecord {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    defaults: JobDefaults,
    records: Arc<AsyncMutex<HashMap<String, JobRunRecord>>>,
}

impl Scheduler {
    pub fn new(defaults: JobDefaults) -> Self {
        Self {
            jobs: Vec::new(),
            defaults,
            records: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Registers a job. `handler` is invoked on every fire; instrumentation
    /// (success/failure counters, duration histogram, timestamp gauges) is
    /// applied uniformly by `run` regardless of what the handler does,
    /// mirroring the original's `_wrap_job`.
    pub fn register<F, Fut>(&mut self, job_id: impl Into<String>, cadence: Cadence, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.push(Job {
            id: job_id.into(),
            cadence,
            handler: Arc::new(move || Box::pin(handler())),
            running: Arc::new(AtomicBool::new(false)),
        });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub async fn record_for(&self, job_id: &str) -> JobRunRecord {
        self.records
            .lock()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs every registered job concurrently until `shutdown` resolves.
    /// Each job owns its own ticking task so a slow handler never delays
    /// another job's cadence (§5's "each job_id is serialized with
    /// itself" but jobs run in parallel across each other).
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut handles = Vec::new();
        for idx in 0..self.jobs.len() {
            let this = Arc::clone(&self);
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                this.run_job_loop(idx, shutdown).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    async fn run_job_loop(&self, idx: usize, shutdown: Arc<AtomicBool>) {
        let job = &self.jobs[idx];
        match &job.cadence {
            Cadence::Interval(d) => {
                let mut ticker = tokio::time::interval(*d);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    self.fire(job).await;
                }
            }
            Cadence::Cron(expr) => {
                let expr = expr.clone();
                self.cron_loop(job, shutdown, move |now| cron_matches(&expr, now))
                    .await;
            }
            Cadence::CronTz(expr, tz) => {
                let expr = expr.clone();
                let tz = *tz;
                self.cron_loop(job, shutdown, move |now| cron_matches_tz(&expr, now, tz))
                    .await;
            }
        }
    }

    /// Walks every whole-minute boundary since the loop's last check,
    /// rather than only `now`'s, so a tick delayed by a long-running
    /// `fire()` doesn't silently swallow a cron match that fell in
    /// between. A match more than `misfire_grace` old is logged and
    /// skipped instead of fired late (§4.C8).
    async fn cron_loop<P>(&self, job: &Job, shutdown: Arc<AtomicBool>, predicate: P)
    where
        P: Fn(DateTime<Utc>) -> Result<bool>,
    {
        let mut last_fired_minute: Option<DateTime<Utc>> = None;
        let mut last_checked: Option<DateTime<Utc>> = None;
        let misfire_grace = ChronoDuration::from_std(self.defaults.misfire_grace).unwrap_or(ChronoDuration::zero());
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let now = Utc::now();
            let bucket = minute_bucket(now);

            let mut start_bucket = match last_checked {
                Some(prev) => minute_bucket(prev) + ChronoDuration::minutes(1),
                None => bucket,
            };
            last_checked = Some(now);
            // Guard against clock jumps (suspend/resume, manual clock set):
            // never backfill more than the grace window's worth of minutes.
            if bucket - start_bucket > misfire_grace.max(ChronoDuration::hours(1)) {
                start_bucket = bucket;
            }

            let mut candidate = start_bucket;
            while candidate <= bucket {
                if Some(candidate) != last_fired_minute {
                    match predicate(candidate) {
                        Ok(true) => {
                            let lateness = now - candidate;
                            if lateness <= misfire_grace {
                                last_fired_minute = Some(candidate);
                                self.fire(job).await;
                            } else {
                                warn!(job_id = %job.id, scheduled = %candidate, lateness_secs = lateness.num_seconds(), "skipping misfired cron run: past misfire_grace");
                                last_fired_minute = Some(candidate);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => error!(job_id = %job.id, error = %e, "cron predicate failed"),
                    }
                }
                candidate += ChronoDuration::minutes(1);
            }
        }
    }

    /// Fires `job.handler` unless an instance is already running
    /// (coalescing, §8 property 7), then records uniform instrumentation.
    async fn fire(&self, job: &Job) {
        if job
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(job_id = %job.id, "skipping fire: previous execution still running");
            return;
        }
        let start = std::time::Instant::now();
        let handler = Arc::clone(&job.handler);
        let result = handler().await;
        let duration = start.elapsed();
        job.running.store(false, Ordering::SeqCst);

        let now = Utc::now();
        let status = if result.is_ok() { "success" } else { "failed" };
        metrics::counter!("collector_scheduler_job_runs_total", "job_id" => job.id.clone(), "status" => status.to_string())
            .increment(1);
        metrics::histogram!("collector_scheduler_job_duration_seconds", "job_id" => job.id.clone())
            .record(duration.as_secs_f64());

        let mut records = self.records.lock().await;
        let record = records.entry(job.id.clone()).or_default();
        match &result {
            Ok(()) => {
                record.last_success_at = Some(now);
                metrics::gauge!("collector_scheduler_job_last_success_timestamp", "job_id" => job.id.clone())
                    .set(now.timestamp() as f64);
                info!(job_id = %job.id, duration_ms = duration.as_millis(), "job succeeded");
            }
            Err(e) => {
                record.last_failure_at = Some(now);
                metrics::gauge!("collector_scheduler_job_last_failure_timestamp", "job_id" => job.id.clone())
                    .set(now.timestamp() as f64);
                error!(job_id = %job.id, error = %e, "job failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wildcard_matches_everything() {
        let cron = Cadence::parse_cron("* * * * *").unwrap();
        assert!(cron_matches(&cron, dt(2026, 1, 1, 0, 0)).unwrap());
    }

    #[test]
    fn step_matches_every_n() {
        let cron = Cadence::parse_cron("*/15 * * * *").unwrap();
        assert!(cron_matches(&cron, dt(2026, 1, 1, 0, 0)).unwrap());
        assert!(cron_matches(&cron, dt(2026, 1, 1, 0, 15)).unwrap());
        assert!(!cron_matches(&cron, dt(2026, 1, 1, 0, 7)).unwrap());
    }

    #[test]
    fn day_of_week_0_and_7_both_mean_sunday() {
        // 2026-01-04 is a Sunday.
        let sunday = dt(2026, 1, 4, 12, 0);
        let cron0 = Cadence::parse_cron("0 12 * * 0").unwrap();
        let cron7 = Cadence::parse_cron("0 12 * * 7").unwrap();
        assert!(cron_matches(&cron0, sunday).unwrap());
        assert!(cron_matches(&cron7, sunday).unwrap());
    }

    #[test]
    fn mon_fri_range_excludes_weekend() {
        let cron = Cadence::parse_cron("5 17-23 * * 1-5").unwrap();
        let monday = dt(2026, 1, 5, 18, 5); // Monday
        let sunday = dt(2026, 1, 4, 18, 5); // Sunday
        assert!(cron_matches(&cron, monday).unwrap());
        assert!(!cron_matches(&cron, sunday).unwrap());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(Cadence::parse_cron("* * * *").is_err());
    }

    #[test]
    fn rejects_zero_step() {
        assert!(Cadence::parse_cron("*/0 * * * *").is_err());
    }

    #[tokio::test]
    async fn coalesces_overlapping_fires() {
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut scheduler = Scheduler::new(JobDefaults::default());
        let conc = Arc::clone(&concurrent);
        let maxc = Arc::clone(&max_concurrent);
        scheduler.register("slow_job", Cadence::interval_secs(0), move || {
            let conc = Arc::clone(&conc);
            let maxc = Arc::clone(&maxc);
            async move {
                let cur = conc.fetch_add(1, Ordering::SeqCst) + 1;
                maxc.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                conc.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let scheduler = Arc::new(scheduler);
        let job_idx = 0;

        // Launch two fires concurrently: the second should observe
        // `running == true` and coalesce into a no-op rather than
        // overlapping execution of the handler.
        let s1 = Arc::clone(&scheduler);
        let s2 = Arc::clone(&scheduler);
        tokio::join!(
            async move { s1.fire(&s1.jobs[job_idx]).await },
            async move { s2.fire(&s2.jobs[job_idx]).await }
        );
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
