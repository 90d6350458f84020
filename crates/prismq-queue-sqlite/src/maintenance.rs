//! Database maintenance: checkpoints, vacuum, statistics, retention.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use thiserror::Error;

use prismq_core::QueueError;

use crate::store::{format_utc, map_sqlite_err, SqliteQueue};

/// Tables eligible for targeted ANALYZE.
const KNOWN_TABLES: &[&str] = &["task_queue", "workers", "task_logs"];

/// WAL checkpoint aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Checkpoint what's possible without blocking.
    Passive,
    /// Block readers until all WAL content is checkpointed.
    Full,
    /// Like `Full`, also resets the WAL.
    Restart,
    /// Like `Restart`, also truncates the WAL to zero bytes.
    Truncate,
}

impl CheckpointMode {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    /// 1 when the checkpoint could not run to completion.
    pub busy: i64,
    /// WAL pages written.
    pub log_pages: i64,
    /// WAL pages successfully checkpointed.
    pub checkpointed: i64,
}

/// Size and layout facts about the database file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub page_count: i64,
    pub page_size: i64,
    pub freelist_count: i64,
    pub total_size_bytes: i64,
    pub wal_size_bytes: u64,
    pub wal_mode: bool,
}

/// What `optimize` did, with before/after stats.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub analyzed: bool,
    pub vacuumed: bool,
    pub stats_before: DatabaseStats,
    pub stats_after: DatabaseStats,
}

/// Maintenance failures.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Maintenance operations bound to a queue store.
pub struct QueueMaintenance {
    queue: Arc<SqliteQueue>,
}

impl QueueMaintenance {
    pub fn new(queue: Arc<SqliteQueue>) -> Self {
        Self { queue }
    }

    /// Execute a WAL checkpoint.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointStats, MaintenanceError> {
        let stats = self.queue.read(|conn| {
            conn.query_row(
                &format!("PRAGMA wal_checkpoint({})", mode.as_str()),
                [],
                |row| {
                    Ok(CheckpointStats {
                        busy: row.get(0)?,
                        log_pages: row.get(1)?,
                        checkpointed: row.get(2)?,
                    })
                },
            )
            .map_err(map_sqlite_err)
        })?;

        tracing::debug!(mode = mode.as_str(), ?stats, "wal checkpoint");
        Ok(stats)
    }

    /// Rebuild the database file, reclaiming free pages.
    ///
    /// Takes an exclusive lock and can run for a long time on a large file;
    /// schedule it in a maintenance window. Runs outside any transaction.
    pub fn vacuum(&self) -> Result<(), MaintenanceError> {
        tracing::info!("VACUUM started");
        self.queue.read(|conn| {
            conn.execute("VACUUM", []).map_err(map_sqlite_err)?;
            Ok(())
        })?;
        tracing::info!("VACUUM finished");
        Ok(())
    }

    /// Refresh query-planner statistics. Fast and non-blocking.
    pub fn analyze(&self, table: Option<&str>) -> Result<(), MaintenanceError> {
        if let Some(table) = table {
            if !KNOWN_TABLES.contains(&table) {
                return Err(MaintenanceError::UnknownTable(table.to_string()));
            }
        }

        self.queue.read(|conn| {
            match table {
                Some(table) => conn
                    .execute_batch(&format!("ANALYZE {table}"))
                    .map_err(map_sqlite_err)?,
                None => conn.execute_batch("ANALYZE").map_err(map_sqlite_err)?,
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Run `PRAGMA integrity_check`. Returns `["ok"]` for an intact file.
    pub fn integrity_check(&self) -> Result<Vec<String>, MaintenanceError> {
        let messages = self.queue.read(|conn| {
            let mut statement = conn
                .prepare("PRAGMA integrity_check")
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })?;
        Ok(messages)
    }

    /// Page-level statistics plus WAL sidecar size.
    pub fn database_stats(&self) -> Result<DatabaseStats, MaintenanceError> {
        let (page_count, page_size, freelist_count, journal_mode) =
            self.queue.read(|conn| {
                let page_count: i64 = conn
                    .query_row("PRAGMA page_count", [], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                let page_size: i64 = conn
                    .query_row("PRAGMA page_size", [], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                let freelist_count: i64 = conn
                    .query_row("PRAGMA freelist_count", [], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                let journal_mode: String = conn
                    .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(map_sqlite_err)?;
                Ok((page_count, page_size, freelist_count, journal_mode))
            })?;

        let wal_path = {
            let mut name = self
                .queue
                .path()
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push("-wal");
            self.queue.path().with_file_name(name)
        };
        let wal_size_bytes = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);

        Ok(DatabaseStats {
            page_count,
            page_size,
            freelist_count,
            total_size_bytes: page_count * page_size,
            wal_size_bytes,
            wal_mode: journal_mode.eq_ignore_ascii_case("wal"),
        })
    }

    /// ANALYZE always; VACUUM too when `full`.
    pub fn optimize(&self, full: bool) -> Result<OptimizeReport, MaintenanceError> {
        let stats_before = self.database_stats()?;
        self.analyze(None)?;
        if full {
            self.vacuum()?;
        }
        let stats_after = self.database_stats()?;

        Ok(OptimizeReport {
            analyzed: true,
            vacuumed: full,
            stats_before,
            stats_after,
        })
    }

    /// Delete log rows older than `max_age_hours`. Returns the number
    /// removed.
    pub fn cleanup_old_logs(&self, max_age_hours: i64) -> Result<usize, MaintenanceError> {
        let cutoff = format_utc(Utc::now() - Duration::hours(max_age_hours.max(0)));
        let removed = self.queue.with_tx(|tx| {
            tx.execute("DELETE FROM task_logs WHERE at_utc < ?1", params![cutoff])
                .map_err(map_sqlite_err)
        })?;
        if removed > 0 {
            tracing::info!(removed, max_age_hours, "pruned old task logs");
        }
        Ok(removed)
    }

    /// Delete terminal tasks finished more than `older_than_hours` ago,
    /// together with their log streams. Returns the number of tasks removed.
    pub fn cleanup_finished_tasks(&self, older_than_hours: i64) -> Result<usize, MaintenanceError> {
        let cutoff = format_utc(Utc::now() - Duration::hours(older_than_hours.max(0)));
        let removed = self.queue.with_tx(|tx| {
            tx.execute(
                "DELETE FROM task_logs
                 WHERE task_id IN (
                     SELECT id FROM task_queue
                     WHERE status IN ('completed', 'failed', 'dead_letter')
                         AND finished_at_utc < ?1
                 )",
                params![cutoff],
            )
            .map_err(map_sqlite_err)?;
            tx.execute(
                "DELETE FROM task_queue
                 WHERE status IN ('completed', 'failed', 'dead_letter')
                     AND finished_at_utc < ?1",
                params![cutoff],
            )
            .map_err(map_sqlite_err)
        })?;
        if removed > 0 {
            tracing::info!(removed, older_than_hours, "pruned finished tasks");
        }
        Ok(removed)
    }
}
