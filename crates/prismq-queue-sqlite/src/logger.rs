//! Per-task diagnostic log stream.
//!
//! Append-only; retention lives in maintenance (`cleanup_old_logs`).

use std::sync::Arc;

use rusqlite::params;
use serde_json::Value;

use prismq_core::{LogLevel, QueueError, TaskLog};

use crate::store::{map_sqlite_err, now_string, parse_utc, SqliteQueue};

/// Writer/reader for the `task_logs` table.
pub struct TaskLogger {
    queue: Arc<SqliteQueue>,
}

impl TaskLogger {
    pub fn new(queue: Arc<SqliteQueue>) -> Self {
        Self { queue }
    }

    /// Append one entry. The task must exist (enforced by the foreign key).
    pub fn log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<&Value>,
    ) -> Result<i64, QueueError> {
        let now = now_string();
        let details_json = details.map(|value| value.to_string());
        self.queue.with_tx(|tx| {
            tx.execute(
                "INSERT INTO task_logs (task_id, at_utc, level, message, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id, now, level.as_str(), message, details_json],
            )
            .map_err(map_sqlite_err)?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// All entries for a task, oldest first.
    pub fn logs_for_task(&self, task_id: i64) -> Result<Vec<TaskLog>, QueueError> {
        self.queue.read(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT log_id, task_id, at_utc, level, message, details
                     FROM task_logs
                     WHERE task_id = ?1
                     ORDER BY at_utc ASC, log_id ASC",
                )
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map(params![task_id], |row| {
                    let at_raw: Option<String> = row.get(2)?;
                    let level_raw: String = row.get(3)?;
                    let details_raw: Option<String> = row.get(5)?;
                    Ok(TaskLog {
                        log_id: row.get(0)?,
                        task_id: row.get(1)?,
                        at_utc: at_raw.and_then(|raw| parse_utc(&raw).ok()),
                        level: level_raw.parse().unwrap_or(LogLevel::Info),
                        message: row.get(4)?,
                        details: details_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                    })
                })
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }
}
