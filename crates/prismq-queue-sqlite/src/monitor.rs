//! Worker presence tracking and stale-lease reclamation.
//!
//! Workers publish heartbeats by upserting their row. A monitor sweep finds
//! leases that outlived their worker and makes the tasks claimable again,
//! counting the lost lease as an attempt.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use prismq_core::{QueueError, Worker};

use crate::store::{format_utc, map_sqlite_err, now_string, parse_utc, SqliteQueue};

/// Result of one reclamation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Tasks returned to `queued` with an incremented attempt count.
    pub requeued: usize,
    /// Tasks whose lease expiry exhausted the retry budget.
    pub dead_lettered: usize,
}

impl ReclaimOutcome {
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}

const RECLAIM_ERROR_MESSAGE: &str = "lease expired: task reclaimed after worker failure";

impl SqliteQueue {
    // ------------------------------------------------------------------
    // Worker registry
    // ------------------------------------------------------------------

    /// Upsert the worker row, refreshing capabilities and heartbeat.
    pub fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &Value,
    ) -> Result<(), QueueError> {
        let now = now_string();
        let capabilities_json = capabilities.to_string();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO workers (worker_id, capabilities, heartbeat_utc)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(worker_id) DO UPDATE SET
                     capabilities = excluded.capabilities,
                     heartbeat_utc = excluded.heartbeat_utc",
                params![worker_id, capabilities_json, now],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    /// Refresh the heartbeat only. Returns whether the worker row exists.
    pub fn update_heartbeat(&self, worker_id: &str) -> Result<bool, QueueError> {
        let now = now_string();
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE workers SET heartbeat_utc = ?1 WHERE worker_id = ?2",
                    params![now, worker_id],
                )
                .map_err(map_sqlite_err)?;
            Ok(changed > 0)
        })
    }

    /// Delete a worker row. Returns whether a row was removed.
    pub fn remove_worker(&self, worker_id: &str) -> Result<bool, QueueError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "DELETE FROM workers WHERE worker_id = ?1",
                    params![worker_id],
                )
                .map_err(map_sqlite_err)?;
            Ok(changed > 0)
        })
    }

    /// Fetch one worker row.
    pub fn worker(&self, worker_id: &str) -> Result<Option<Worker>, QueueError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT worker_id, capabilities, heartbeat_utc FROM workers WHERE worker_id = ?1",
                params![worker_id],
                map_worker_row,
            )
            .optional()
            .map_err(map_sqlite_err)
        })
    }

    /// All registered workers, ordered by id.
    pub fn workers(&self) -> Result<Vec<Worker>, QueueError> {
        self.read(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT worker_id, capabilities, heartbeat_utc
                     FROM workers ORDER BY worker_id",
                )
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map([], map_worker_row)
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }

    /// Workers whose heartbeat is within `active_threshold_seconds`.
    pub fn active_workers(
        &self,
        active_threshold_seconds: i64,
    ) -> Result<Vec<Worker>, QueueError> {
        let cutoff = format_utc(Utc::now() - Duration::seconds(active_threshold_seconds));
        self.read(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT worker_id, capabilities, heartbeat_utc
                     FROM workers
                     WHERE heartbeat_utc >= ?1
                     ORDER BY heartbeat_utc DESC",
                )
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map(params![cutoff], map_worker_row)
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }

    /// Workers whose heartbeat is older than `stale_threshold_seconds`.
    pub fn stale_workers(
        &self,
        stale_threshold_seconds: i64,
    ) -> Result<Vec<Worker>, QueueError> {
        let cutoff = format_utc(Utc::now() - Duration::seconds(stale_threshold_seconds));
        self.read(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT worker_id, capabilities, heartbeat_utc
                     FROM workers
                     WHERE heartbeat_utc < ?1
                     ORDER BY heartbeat_utc ASC",
                )
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map(params![cutoff], map_worker_row)
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Return expired leases to the queue.
    ///
    /// The reclamation counts as an attempt. Rows whose increment would
    /// reach `max_attempts` are dead-lettered instead of requeued, keeping
    /// `attempts <= max_attempts` everywhere. Terminal rows are never
    /// touched.
    pub fn reclaim_expired_leases(&self) -> Result<ReclaimOutcome, QueueError> {
        let now = now_string();
        let outcome = self.with_tx(|tx| {
            let requeued = tx
                .execute(
                    "UPDATE task_queue
                     SET status = 'queued',
                         attempts = attempts + 1,
                         locked_by = NULL,
                         lease_until_utc = NULL,
                         reserved_at_utc = NULL,
                         processing_started_utc = NULL,
                         updated_at_utc = ?1
                     WHERE status IN ('leased', 'processing')
                         AND lease_until_utc IS NOT NULL
                         AND lease_until_utc < ?1
                         AND attempts + 1 < max_attempts",
                    params![now],
                )
                .map_err(map_sqlite_err)?;

            // Whatever is still expired had no budget left.
            let dead_lettered = tx
                .execute(
                    "UPDATE task_queue
                     SET status = 'failed',
                         attempts = attempts + 1,
                         locked_by = NULL,
                         lease_until_utc = NULL,
                         error_message = ?2,
                         finished_at_utc = ?1,
                         updated_at_utc = ?1
                     WHERE status IN ('leased', 'processing')
                         AND lease_until_utc IS NOT NULL
                         AND lease_until_utc < ?1",
                    params![now, RECLAIM_ERROR_MESSAGE],
                )
                .map_err(map_sqlite_err)?;

            Ok(ReclaimOutcome {
                requeued,
                dead_lettered,
            })
        })?;

        if outcome.total() > 0 {
            tracing::info!(
                requeued = outcome.requeued,
                dead_lettered = outcome.dead_lettered,
                "reclaimed expired leases"
            );
        }
        Ok(outcome)
    }

    /// Delete stale worker rows.
    ///
    /// Without `force`, only workers owning no leased tasks are removed.
    /// With `force`, owned tasks are first reclaimed (attempt incremented,
    /// budget respected) and the workers deleted regardless.
    pub fn cleanup_stale_workers(
        &self,
        stale_threshold_seconds: i64,
        force: bool,
    ) -> Result<usize, QueueError> {
        let now = now_string();
        let cutoff = format_utc(Utc::now() - Duration::seconds(stale_threshold_seconds));

        let removed = self.with_tx(|tx| {
            if force {
                tx.execute(
                    "UPDATE task_queue
                     SET status = 'queued',
                         attempts = attempts + 1,
                         locked_by = NULL,
                         lease_until_utc = NULL,
                         reserved_at_utc = NULL,
                         processing_started_utc = NULL,
                         updated_at_utc = ?1
                     WHERE status IN ('leased', 'processing')
                         AND locked_by IN (SELECT worker_id FROM workers WHERE heartbeat_utc < ?2)
                         AND attempts + 1 < max_attempts",
                    params![now, cutoff],
                )
                .map_err(map_sqlite_err)?;
                tx.execute(
                    "UPDATE task_queue
                     SET status = 'failed',
                         attempts = attempts + 1,
                         locked_by = NULL,
                         lease_until_utc = NULL,
                         error_message = ?3,
                         finished_at_utc = ?1,
                         updated_at_utc = ?1
                     WHERE status IN ('leased', 'processing')
                         AND locked_by IN (SELECT worker_id FROM workers WHERE heartbeat_utc < ?2)",
                    params![now, cutoff, RECLAIM_ERROR_MESSAGE],
                )
                .map_err(map_sqlite_err)?;

                tx.execute(
                    "DELETE FROM workers WHERE heartbeat_utc < ?1",
                    params![cutoff],
                )
                .map_err(map_sqlite_err)
            } else {
                tx.execute(
                    "DELETE FROM workers
                     WHERE heartbeat_utc < ?1
                         AND worker_id NOT IN (
                             SELECT locked_by FROM task_queue
                             WHERE status IN ('leased', 'processing')
                                 AND locked_by IS NOT NULL
                         )",
                    params![cutoff],
                )
                .map_err(map_sqlite_err)
            }
        })?;

        if removed > 0 {
            tracing::info!(removed, force, "cleaned up stale workers");
        }
        Ok(removed)
    }
}

fn map_worker_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let capabilities_raw: String = row.get("capabilities")?;
    let heartbeat_raw: Option<String> = row.get("heartbeat_utc")?;
    let heartbeat_utc = match heartbeat_raw {
        None => None,
        Some(text) => Some(parse_utc(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?),
    };

    Ok(Worker {
        worker_id: row.get("worker_id")?,
        capabilities: serde_json::from_str(&capabilities_raw)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
        heartbeat_utc,
    })
}
