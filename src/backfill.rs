//! Backfill Scheduler (§4.C6): task state machine, gap-driven task
//! creation, and priority-ordered execution against a connector.

use crate::connector::Connector;
use crate::storage::{BackfillTaskRow, Storage};
use crate::types::{BackfillDataType, BackfillTask, Gap, TaskStatus, Timeframe};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Collapses adjacent missing runs separated by <= 1 bucket, then assigns
/// one backfill task per run with priority proportional to recency and
/// run length (§4.C6's gap detection driver).
pub fn gaps_to_tasks(
    market_id: i64,
    timeframe: Timeframe,
    gaps: &[Gap],
    now: DateTime<Utc>,
) -> Vec<BackfillTask> {
    let merged = merge_adjacent_gaps(gaps, timeframe);
    merged
        .into_iter()
        .map(|gap| {
            let recency_secs = (now - gap.end_time).num_seconds().max(0);
            // More recent gaps and longer runs both raise priority; recency
            // is inverted (closer to now => higher) via a large constant
            // minus elapsed seconds, floored at 0.
            let recency_score = (86_400 - recency_secs).max(0);
            let priority = recency_score + gap.missing_count * 60;
            BackfillTask {
                id: 0,
                market_id,
                data_type: BackfillDataType::Ohlcv,
                timeframe: Some(timeframe),
                start_time: gap.start_time,
                end_time: gap.end_time,
                priority,
                retry_count: 0,
                max_retries: 3,
                expected_records: Some(gap.missing_count),
                actual_records: None,
                status: TaskStatus::Pending,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            }
        })
        .collect()
}

fn merge_adjacent_gaps(gaps: &[Gap], timeframe: Timeframe) -> Vec<Gap> {
    if gaps.is_empty() {
        return Vec::new();
    }
    let step = timeframe.duration();
    let mut merged = vec![gaps[0].clone()];
    for gap in &gaps[1..] {
        let last = merged.last_mut().unwrap();
        if gap.start_time - last.end_time <= step {
            let extended_count = (gap.end_time - last.start_time).num_seconds() / step.num_seconds();
            last.end_time = gap.end_time;
            last.missing_count = extended_count.max(last.missing_count + gap.missing_count);
        } else {
            merged.push(gap.clone());
        }
    }
    merged
}

/// Enqueues one task per merged gap run via `Storage::create_backfill_task`.
pub fn create_tasks_from_gaps(
    storage: &Storage,
    market_id: i64,
    timeframe: Timeframe,
    gaps: &[Gap],
    now: DateTime<Utc>,
) -> Result<usize> {
    let tasks = gaps_to_tasks(market_id, timeframe, gaps, now);
    let mut created = 0;
    for task in &tasks {
        storage.create_backfill_task(task)?;
        created += 1;
    }
    Ok(created)
}

/// Executes a single pending task to completion: fetches from `cursor =
/// task.start_time` until the last returned bar reaches `task.end_time` or
/// the connector returns an empty batch, upserting through storage as it
/// goes (§4.C6's execution step).
pub async fn execute_task(
    storage: &Storage,
    connector: &dyn Connector,
    task: &BackfillTaskRow,
    symbol: &str,
) -> Result<i64> {
    storage.mark_task_running(task.id)?;

    let Some(timeframe) = task.timeframe.as_deref().and_then(Timeframe::parse) else {
        let msg = "backfill task has no timeframe for an ohlcv data_type".to_string();
        storage.mark_task_failed(task.id, &msg)?;
        bail!(msg);
    };

    let mut cursor = DateTime::<Utc>::from_timestamp(task.start_time, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid task.start_time"))?;
    let end = DateTime::<Utc>::from_timestamp(task.end_time, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid task.end_time"))?;

    let mut total_written: i64 = 0;
    loop {
        let fetch_result = connector.fetch_ohlcv(symbol, timeframe, cursor, 1000).await;
        let (bars, _meta) = match fetch_result {
            Ok(v) => v,
            Err(e) => {
                let msg = e.to_string();
                storage.mark_task_failed(task.id, &msg)?;
                bail!(msg);
            }
        };
        if bars.is_empty() {
            break;
        }

        let last_ts = bars.last().unwrap().bucket_start_time;
        // Non-monotonic cursor advance would spin forever; treat it as a
        // terminal parse error (§4.C6).
        if last_ts <= cursor && cursor != DateTime::<Utc>::from_timestamp(task.start_time, 0).unwrap() {
            let msg = format!("connector returned non-monotonic cursor: {last_ts} <= {cursor}");
            storage.mark_task_failed(task.id, &msg)?;
            bail!(msg);
        }

        let written = storage.upsert_ohlcv_batch(task.market_id, timeframe, &bars)?;
        total_written += written as i64;

        if last_ts >= end {
            break;
        }
        cursor = last_ts;
    }

    storage.mark_task_completed(task.id, total_written)?;
    info!(task_id = task.id, total_written, "backfill task completed");
    Ok(total_written)
}

/// Selects and runs up to `limit` pending tasks, one after another, never
/// letting one failing task abort the sweep (§4.C7's "one failing config
/// never aborts the cycle" applied to backfill).
pub async fn run_backfill_sweep(
    storage: &Storage,
    connector: &dyn Connector,
    symbol_for_market: impl Fn(i64) -> Option<String>,
    limit: u32,
) -> Result<usize> {
    let retried = storage.retry_failed_tasks(limit)?;
    if retried > 0 {
        info!(retried, "reset failed backfill tasks to pending");
    }

    let pending = storage.get_pending_tasks(limit)?;
    crate::metrics::record_backfill_tasks_pending(pending.len() as u64);
    let mut completed = 0;
    for task in &pending {
        let Some(symbol) = symbol_for_market(task.market_id) else {
            warn!(market_id = task.market_id, "no symbol mapping for backfill task, skipping");
            continue;
        };
        match execute_task(storage, connector, task, &symbol).await {
            Ok(_) => {
                completed += 1;
                crate::metrics::record_backfill_task_completed("completed");
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "backfill task failed");
                crate::metrics::record_backfill_task_completed("failed");
            }
        }
    }
    Ok(completed)
}

/// Cleanup sweep (§4.C6): removes completed tasks older than
/// `retention_days` (default 7), supplemented from
/// `cleanup_old_completed_tasks`.
pub fn cleanup_old_tasks(storage: &Storage, retention_days: i64) -> Result<usize> {
    storage.cleanup_old_completed_tasks(retention_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;
    use crate::storage::Storage;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(minute: i64) -> crate::types::OhlcvBar {
        crate::types::OhlcvBar {
            bucket_start_time: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(1),
        }
    }

    #[test]
    fn merges_adjacent_gaps() {
        let gaps = vec![
            Gap {
                start_time: Utc.timestamp_opt(60, 0).unwrap(),
                end_time: Utc.timestamp_opt(120, 0).unwrap(),
                missing_count: 1,
            },
            Gap {
                start_time: Utc.timestamp_opt(180, 0).unwrap(),
                end_time: Utc.timestamp_opt(240, 0).unwrap(),
                missing_count: 1,
            },
        ];
        let merged = merge_adjacent_gaps(&gaps, Timeframe::OneMinute);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn gaps_to_tasks_sets_priority() {
        let gaps = vec![Gap {
            start_time: Utc.timestamp_opt(0, 0).unwrap(),
            end_time: Utc.timestamp_opt(300, 0).unwrap(),
            missing_count: 5,
        }];
        let tasks = gaps_to_tasks(1, Timeframe::OneMinute, &gaps, Utc.timestamp_opt(300, 0).unwrap());
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].priority > 0);
    }

    #[tokio::test]
    async fn executes_task_to_completion() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        let mock = MockConnector::new("binance");
        mock.push_bars(vec![bar(0), bar(1), bar(2)]);
        mock.push_bars(vec![]);

        let task = BackfillTask {
            id: 0,
            market_id: market,
            data_type: BackfillDataType::Ohlcv,
            timeframe: Some(Timeframe::OneMinute),
            start_time: Utc.timestamp_opt(0, 0).unwrap(),
            end_time: Utc.timestamp_opt(120, 0).unwrap(),
            priority: 10,
            retry_count: 0,
            max_retries: 3,
            expected_records: Some(3),
            actual_records: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = storage.create_backfill_task(&task).unwrap();
        let row = storage
            .get_pending_tasks(10)
            .unwrap()
            .into_iter()
            .find(|t| t.id == id)
            .unwrap();

        let written = execute_task(&storage, &mock, &row, "BTCUSDT").await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(storage.task_status(id).unwrap(), Some(TaskStatus::Completed));
    }
}
