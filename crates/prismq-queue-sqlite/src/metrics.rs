//! Read-only metrics over the queue store.
//!
//! Every query either walks one of the schema indexes or reads a view; none
//! of them mutate state. Percentiles are computed in memory from the sorted
//! durations, matching the store's small-window usage.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use prismq_core::{QueueError, TaskStatus};

use crate::store::{format_utc, map_sqlite_err, parse_utc, SqliteQueue};

/// Completed-vs-failed counts over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SuccessFailureRates {
    pub success_count: i64,
    pub failure_count: i64,
    pub total_count: i64,
    pub success_rate: f64,
    pub failure_rate: f64,
}

/// Completion volume over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThroughputMetrics {
    pub tasks_completed: i64,
    pub tasks_per_minute: f64,
    pub avg_processing_seconds: f64,
}

/// Retry pressure over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetryMetrics {
    pub total_tasks: i64,
    pub tasks_with_retries: i64,
    pub retry_rate: f64,
    pub avg_attempts: f64,
    pub max_attempts_reached: i64,
}

/// Processing-time distribution for completed tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessingPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// One worker's presence and load.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerActivity {
    pub worker_id: String,
    pub capabilities: Value,
    pub heartbeat_utc: Option<DateTime<Utc>>,
    pub active_tasks: i64,
    pub seconds_since_heartbeat: i64,
}

/// Composite snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub queue_depth_by_status: BTreeMap<String, i64>,
    pub oldest_queued_age_seconds: Option<i64>,
    pub success_failure_rates_24h: SuccessFailureRates,
    pub throughput_1h: ThroughputMetrics,
    pub retry_metrics_24h: RetryMetrics,
    pub active_workers: usize,
    pub generated_at_utc: DateTime<Utc>,
}

/// Metric reader bound to a queue store.
pub struct QueueMetrics {
    queue: Arc<SqliteQueue>,
}

impl QueueMetrics {
    pub fn new(queue: Arc<SqliteQueue>) -> Self {
        Self { queue }
    }

    /// Count tasks, optionally filtered by type and/or status.
    pub fn queue_depth(
        &self,
        task_type: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<i64, QueueError> {
        self.queue.read(|conn| {
            let status_str = status.map(|s| s.as_str());
            let (sql, binds): (&str, Vec<&dyn rusqlite::ToSql>) = match (&task_type, &status_str) {
                (Some(t), Some(s)) => (
                    "SELECT COUNT(*) FROM task_queue WHERE type = ?1 AND status = ?2",
                    vec![t, s],
                ),
                (Some(t), None) => ("SELECT COUNT(*) FROM task_queue WHERE type = ?1", vec![t]),
                (None, Some(s)) => ("SELECT COUNT(*) FROM task_queue WHERE status = ?1", vec![s]),
                (None, None) => ("SELECT COUNT(*) FROM task_queue", vec![]),
            };
            conn.query_row(sql, binds.as_slice(), |row| row.get(0))
                .map_err(map_sqlite_err)
        })
    }

    /// Task counts per status, via `v_queue_status_summary`.
    pub fn queue_depth_by_status(&self) -> Result<BTreeMap<String, i64>, QueueError> {
        self.queue.read(|conn| {
            let mut statement = conn
                .prepare("SELECT status, task_count FROM v_queue_status_summary")
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
                .map_err(map_sqlite_err)
        })
    }

    /// Task counts per type.
    pub fn queue_depth_by_type(&self) -> Result<BTreeMap<String, i64>, QueueError> {
        self.queue.read(|conn| {
            let mut statement = conn
                .prepare("SELECT type, COUNT(*) FROM task_queue GROUP BY type")
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
                .map_err(map_sqlite_err)
        })
    }

    /// Age of the oldest queued task in seconds, or `None` when nothing is
    /// queued.
    pub fn oldest_queued_age_seconds(&self) -> Result<Option<i64>, QueueError> {
        let oldest: Option<String> = self.queue.read(|conn| {
            conn.query_row(
                "SELECT created_at_utc FROM task_queue
                 WHERE status = 'queued'
                 ORDER BY created_at_utc ASC
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)
        })?;

        match oldest {
            None => Ok(None),
            Some(raw) => {
                let created = parse_utc(&raw).map_err(QueueError::database)?;
                Ok(Some((Utc::now() - created).num_seconds().max(0)))
            }
        }
    }

    /// Success and failure rates among rows finished inside the window.
    pub fn success_failure_rates(&self, hours: i64) -> Result<SuccessFailureRates, QueueError> {
        let cutoff = window_cutoff(hours);
        self.queue.read(|conn| {
            let (success, failure, total): (i64, i64, i64) = conn
                .query_row(
                    "SELECT
                        SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status IN ('failed', 'dead_letter') THEN 1 ELSE 0 END),
                        COUNT(*)
                     FROM task_queue
                     WHERE finished_at_utc >= ?1",
                    params![cutoff],
                    |row| {
                        Ok((
                            row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                            row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                            row.get(2)?,
                        ))
                    },
                )
                .map_err(map_sqlite_err)?;

            let (success_rate, failure_rate) = if total > 0 {
                (success as f64 / total as f64, failure as f64 / total as f64)
            } else {
                (0.0, 0.0)
            };

            Ok(SuccessFailureRates {
                success_count: success,
                failure_count: failure,
                total_count: total,
                success_rate,
                failure_rate,
            })
        })
    }

    /// Completed-task throughput inside the window.
    pub fn throughput(&self, hours: i64) -> Result<ThroughputMetrics, QueueError> {
        let cutoff = window_cutoff(hours);
        self.queue.read(|conn| {
            let (completed, avg_seconds): (i64, Option<f64>) = conn
                .query_row(
                    "SELECT
                        COUNT(*),
                        AVG((JULIANDAY(finished_at_utc) - JULIANDAY(processing_started_utc)) * 86400.0)
                     FROM task_queue
                     WHERE status = 'completed'
                         AND finished_at_utc >= ?1
                         AND processing_started_utc IS NOT NULL",
                    params![cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(map_sqlite_err)?;

            let minutes = (hours * 60).max(1) as f64;
            Ok(ThroughputMetrics {
                tasks_completed: completed,
                tasks_per_minute: completed as f64 / minutes,
                avg_processing_seconds: avg_seconds.unwrap_or(0.0),
            })
        })
    }

    /// Retry pressure: terminal rows in the window plus everything still
    /// live.
    pub fn retry_metrics(&self, hours: i64) -> Result<RetryMetrics, QueueError> {
        let cutoff = window_cutoff(hours);
        self.queue.read(|conn| {
            let (total, with_retries, max_reached, avg_attempts): (i64, i64, i64, Option<f64>) =
                conn.query_row(
                    "SELECT
                        COUNT(*),
                        SUM(CASE WHEN attempts > 1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN attempts >= max_attempts
                                 AND status IN ('failed', 'dead_letter') THEN 1 ELSE 0 END),
                        AVG(attempts)
                     FROM task_queue
                     WHERE finished_at_utc >= ?1
                         OR status IN ('queued', 'leased', 'processing')",
                    params![cutoff],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                            row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                            row.get(3)?,
                        ))
                    },
                )
                .map_err(map_sqlite_err)?;

            let retry_rate = if total > 0 {
                with_retries as f64 / total as f64
            } else {
                0.0
            };

            Ok(RetryMetrics {
                total_tasks: total,
                tasks_with_retries: with_retries,
                retry_rate,
                avg_attempts: avg_attempts.unwrap_or(0.0),
                max_attempts_reached: max_reached,
            })
        })
    }

    /// p50/p95/p99 processing time over completed rows in the window,
    /// computed in memory from the sorted values.
    pub fn processing_time_percentiles(
        &self,
        hours: i64,
        task_type: Option<&str>,
    ) -> Result<ProcessingPercentiles, QueueError> {
        let cutoff = window_cutoff(hours);
        let mut times = self.queue.read(|conn| {
            let base = "SELECT (JULIANDAY(finished_at_utc) - JULIANDAY(processing_started_utc)) * 86400.0
                 FROM task_queue
                 WHERE status = 'completed'
                     AND finished_at_utc >= ?1
                     AND processing_started_utc IS NOT NULL";

            let rows: Vec<f64> = if let Some(task_type) = task_type {
                let sql = format!("{base} AND type = ?2");
                let mut statement = conn.prepare(&sql).map_err(map_sqlite_err)?;
                let mapped = statement
                    .query_map(params![cutoff, task_type], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                mapped
                    .collect::<rusqlite::Result<Vec<f64>>>()
                    .map_err(map_sqlite_err)?
            } else {
                let mut statement = conn.prepare(base).map_err(map_sqlite_err)?;
                let mapped = statement
                    .query_map(params![cutoff], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                mapped
                    .collect::<rusqlite::Result<Vec<f64>>>()
                    .map_err(map_sqlite_err)?
            };
            Ok(rows)
        })?;

        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Ok(ProcessingPercentiles {
            p50: percentile(&times, 0.50),
            p95: percentile(&times, 0.95),
            p99: percentile(&times, 0.99),
        })
    }

    /// Per-worker presence and load, via `v_worker_status`.
    pub fn worker_activity(&self) -> Result<Vec<WorkerActivity>, QueueError> {
        self.queue.read(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT worker_id, capabilities, heartbeat_utc, active_tasks,
                            seconds_since_heartbeat
                     FROM v_worker_status
                     ORDER BY active_tasks DESC, worker_id",
                )
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map([], |row| {
                    let capabilities_raw: String = row.get(1)?;
                    let heartbeat_raw: Option<String> = row.get(2)?;
                    Ok(WorkerActivity {
                        worker_id: row.get(0)?,
                        capabilities: serde_json::from_str(&capabilities_raw)
                            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                        heartbeat_utc: heartbeat_raw.and_then(|raw| parse_utc(&raw).ok()),
                        active_tasks: row.get(3)?,
                        seconds_since_heartbeat: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0)
                            as i64,
                    })
                })
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }

    /// Compose the individual metrics into one snapshot.
    pub fn health_summary(&self) -> Result<HealthSummary, QueueError> {
        Ok(HealthSummary {
            queue_depth_by_status: self.queue_depth_by_status()?,
            oldest_queued_age_seconds: self.oldest_queued_age_seconds()?,
            success_failure_rates_24h: self.success_failure_rates(24)?,
            throughput_1h: self.throughput(1)?,
            retry_metrics_24h: self.retry_metrics(24)?,
            active_workers: self.queue.active_workers(60)?.len(),
            generated_at_utc: Utc::now(),
        })
    }
}

fn window_cutoff(hours: i64) -> String {
    format_utc(Utc::now() - Duration::hours(hours.max(0)))
}

/// Linear-interpolation percentile over sorted data.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * p;
    let floor = k.floor() as usize;
    let fraction = k - floor as f64;
    if floor + 1 < sorted.len() {
        sorted[floor] + fraction * (sorted[floor + 1] - sorted[floor])
    } else {
        sorted[floor]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prismq_core::{ClaimRequest, NewTask, SchedulingStrategy, TaskStore};
    use serde_json::json;

    fn open_queue() -> (tempfile::TempDir, Arc<SqliteQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SqliteQueue::open(dir.path().join("queue.db")).unwrap());
        (dir, queue)
    }

    fn run_one(queue: &SqliteQueue, succeed: bool) {
        let task = queue
            .claim_task(&ClaimRequest::new("worker-m", 60).strategy(SchedulingStrategy::Fifo))
            .unwrap()
            .unwrap();
        queue.begin_processing(task.id).unwrap();
        if succeed {
            queue.complete_task(task.id).unwrap();
        } else {
            queue.fail_task(task.id, "boom", false).unwrap();
        }
    }

    #[test]
    fn test_queue_depth_filters() {
        let (_dir, queue) = open_queue();
        queue.enqueue(&NewTask::new("a", json!({}))).unwrap();
        queue.enqueue(&NewTask::new("a", json!({}))).unwrap();
        queue.enqueue(&NewTask::new("b", json!({}))).unwrap();

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        assert_eq!(metrics.queue_depth(None, None).unwrap(), 3);
        assert_eq!(metrics.queue_depth(Some("a"), None).unwrap(), 2);
        assert_eq!(
            metrics
                .queue_depth(Some("a"), Some(TaskStatus::Queued))
                .unwrap(),
            2
        );
        assert_eq!(
            metrics
                .queue_depth(None, Some(TaskStatus::Completed))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_depth_by_status_counts_transitions() {
        let (_dir, queue) = open_queue();
        for _ in 0..3 {
            queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        }
        run_one(&queue, true);
        run_one(&queue, false);

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        let depths = metrics.queue_depth_by_status().unwrap();
        assert_eq!(depths.get("queued"), Some(&1));
        assert_eq!(depths.get("completed"), Some(&1));
        assert_eq!(depths.get("failed"), Some(&1));
    }

    #[test]
    fn test_oldest_queued_age() {
        let (_dir, queue) = open_queue();
        let metrics = QueueMetrics::new(Arc::clone(&queue));
        assert_eq!(metrics.oldest_queued_age_seconds().unwrap(), None);

        queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        let age = metrics.oldest_queued_age_seconds().unwrap().unwrap();
        assert!(age <= 5);
    }

    #[test]
    fn test_success_failure_rates() {
        let (_dir, queue) = open_queue();
        for _ in 0..4 {
            queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        }
        run_one(&queue, true);
        run_one(&queue, true);
        run_one(&queue, true);
        run_one(&queue, false);

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        let rates = metrics.success_failure_rates(24).unwrap();
        assert_eq!(rates.success_count, 3);
        assert_eq!(rates.failure_count, 1);
        assert_eq!(rates.total_count, 4);
        assert!((rates.success_rate - 0.75).abs() < 1e-9);
        assert!((rates.failure_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_counts_completions() {
        let (_dir, queue) = open_queue();
        for _ in 0..2 {
            queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        }
        run_one(&queue, true);
        run_one(&queue, true);

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        let throughput = metrics.throughput(1).unwrap();
        assert_eq!(throughput.tasks_completed, 2);
        assert!(throughput.tasks_per_minute > 0.0);
        assert!(throughput.avg_processing_seconds >= 0.0);
    }

    #[test]
    fn test_retry_metrics_track_dead_letters() {
        let (_dir, queue) = open_queue();
        queue
            .enqueue(&NewTask::new("t", json!({})).max_attempts(1))
            .unwrap();
        run_one(&queue, false);

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        let retry = metrics.retry_metrics(24).unwrap();
        assert_eq!(retry.total_tasks, 1);
        assert_eq!(retry.max_attempts_reached, 1);
        assert_eq!(retry.tasks_with_retries, 0);
    }

    #[test]
    fn test_percentile_interpolation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&data, 0.50) - 2.5).abs() < 1e-9);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&data, 1.0) - 4.0).abs() < 1e-9);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_processing_percentiles_empty_window() {
        let (_dir, queue) = open_queue();
        let metrics = QueueMetrics::new(queue);
        let percentiles = metrics.processing_time_percentiles(24, None).unwrap();
        assert_eq!(percentiles, ProcessingPercentiles::default());
    }

    #[test]
    fn test_worker_activity_and_health_summary() {
        let (_dir, queue) = open_queue();
        queue.register_worker("worker-1", &json!({ "gpu": true })).unwrap();
        queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
        queue
            .claim_task(&ClaimRequest::new("worker-1", 60).strategy(SchedulingStrategy::Fifo))
            .unwrap()
            .unwrap();

        let metrics = QueueMetrics::new(Arc::clone(&queue));
        let activity = metrics.worker_activity().unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].worker_id, "worker-1");
        assert_eq!(activity[0].active_tasks, 1);
        assert!(activity[0].seconds_since_heartbeat < 60);

        let summary = metrics.health_summary().unwrap();
        assert_eq!(summary.active_workers, 1);
        assert_eq!(summary.queue_depth_by_status.get("leased"), Some(&1));
        // The snapshot is serializable for the HTTP layer above.
        let encoded = serde_json::to_value(&summary).unwrap();
        assert!(encoded["queue_depth_by_status"].is_object());
    }
}
