//! SQLite-backed queue store.
//!
//! One process-wide connection guards the database file. A mutex serializes
//! access through the handle; WAL journaling lets other processes read while
//! a writer holds the reserved lock. Write transactions begin IMMEDIATE so
//! writers serialize at the start instead of deadlocking on a mid-transaction
//! lock upgrade.
//!
//! Timestamps are computed in Rust and bound as UTC text
//! (`YYYY-MM-DD HH:MM:SS.mmm`); the formats compare correctly against the
//! second-precision defaults SQLite writes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde_json::Value;

use prismq_core::{
    ClaimRequest, NewTask, QueueError, RetryConfig, Task, TaskStatus, TaskStore,
};

use crate::claim::claimer_for;
use crate::schema;

/// Timestamp format written by this store.
pub(crate) const TS_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
/// Accepts both our millisecond format and SQLite's `datetime('now')`.
const TS_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Columns selected whenever a full task row is materialized.
pub(crate) const TASK_COLUMNS: &str = "id, type, priority, payload, compatibility, status, \
     attempts, max_attempts, run_after_utc, lease_until_utc, reserved_at_utc, \
     processing_started_utc, finished_at_utc, locked_by, error_message, idempotency_key, \
     created_at_utc, updated_at_utc";

pub(crate) fn format_utc(instant: DateTime<Utc>) -> String {
    instant.naive_utc().format(TS_WRITE_FORMAT).to_string()
}

pub(crate) fn now_string() -> String {
    format_utc(Utc::now())
}

pub(crate) fn instant_after(seconds: f64) -> String {
    format_utc(Utc::now() + Duration::milliseconds((seconds * 1000.0) as i64))
}

pub(crate) fn parse_utc(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    chrono::NaiveDateTime::parse_from_str(raw, TS_PARSE_FORMAT).map(|naive| naive.and_utc())
}

/// Tuning knobs for a queue instance.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Backoff policy applied by `fail_task`.
    pub retry: RetryConfig,
}

/// SQLite implementation of the queue store.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    path: PathBuf,
    retry: RetryConfig,
}

impl SqliteQueue {
    /// Open (or create) the queue database with default options.
    ///
    /// Applies the pragma set and bootstraps the schema; a schema failure is
    /// fatal and surfaces as [`QueueError::Schema`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open_with_options(path, QueueOptions::default())
    }

    /// Open with explicit options.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| QueueError::Database {
                    message: format!("failed to create database directory: {e}"),
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(|e| QueueError::Database {
            message: format!("failed to open database {}: {e}", path.display()),
        })?;

        schema::apply_pragmas(&conn).map_err(|e| QueueError::Database {
            message: format!("failed to apply pragmas: {e}"),
        })?;

        schema::create_schema(&conn).map_err(|e| QueueError::Schema {
            message: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "queue database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            retry: options.retry,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Re-run the idempotent schema bootstrap.
    pub fn initialize_schema(&self) -> Result<(), QueueError> {
        self.read(|conn| {
            schema::create_schema(conn).map_err(|e| QueueError::Schema {
                message: e.to_string(),
            })
        })
    }

    /// Run a read-only closure against the connection. No transaction is
    /// started.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let conn = self.lock_conn();
        f(&conn)
    }

    /// Run a closure inside a `BEGIN IMMEDIATE` transaction. Commits on `Ok`,
    /// rolls back on `Err`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(map_sqlite_err)?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Producer API
    // ------------------------------------------------------------------

    /// Enqueue a task. Returns the new row id.
    ///
    /// A reused idempotency key surfaces as
    /// [`QueueError::DuplicateIdempotencyKey`]; producers treat it as
    /// "already enqueued", not a fault.
    pub fn enqueue(&self, task: &NewTask) -> Result<i64, QueueError> {
        let now = now_string();
        let run_after = task
            .run_after_utc
            .map(format_utc)
            .unwrap_or_else(|| now.clone());
        let payload = task.payload.to_string();
        let compatibility = task.compatibility.to_string();

        self.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO task_queue (
                    type, priority, payload, compatibility,
                    max_attempts, run_after_utc, idempotency_key,
                    created_at_utc, updated_at_utc
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    task.task_type,
                    task.priority,
                    payload,
                    compatibility,
                    task.max_attempts,
                    run_after,
                    task.idempotency_key,
                    now,
                ],
            );

            match inserted {
                Ok(_) => {
                    let id = tx.last_insert_rowid();
                    tracing::debug!(task_id = id, task_type = %task.task_type, "task enqueued");
                    Ok(id)
                }
                Err(e) => Err(map_enqueue_err(e, task.idempotency_key.as_deref())),
            }
        })
    }

    /// Fetch a task snapshot by id.
    pub fn task(&self, task_id: i64) -> Result<Option<Task>, QueueError> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                params![task_id],
                map_task_row,
            )
            .optional()
            .map_err(map_sqlite_err)
        })
    }

    /// Fetch a task snapshot by idempotency key.
    pub fn task_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, QueueError> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE idempotency_key = ?1"),
                params![key],
                map_task_row,
            )
            .optional()
            .map_err(map_sqlite_err)
        })
    }

    /// Task snapshots in a given status, oldest first.
    pub fn tasks_with_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, QueueError> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM task_queue WHERE status = ?1 ORDER BY id ASC LIMIT ?2"
            );
            let mut statement = conn.prepare(&sql).map_err(map_sqlite_err)?;
            let rows = statement
                .query_map(params![status.as_str(), limit as i64], map_task_row)
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_err)
        })
    }
}

impl TaskStore for SqliteQueue {
    fn claim_task(&self, request: &ClaimRequest) -> Result<Option<Task>, QueueError> {
        claimer_for(request.strategy).claim_task(
            self,
            &request.worker_id,
            &request.capabilities,
            request.lease_seconds,
        )
    }

    fn begin_processing(&self, task_id: i64) -> Result<bool, QueueError> {
        SqliteQueue::begin_processing(self, task_id)
    }

    fn complete_task(&self, task_id: i64) -> Result<bool, QueueError> {
        SqliteQueue::complete_task(self, task_id)
    }

    fn fail_task(
        &self,
        task_id: i64,
        error_message: &str,
        retry: bool,
    ) -> Result<bool, QueueError> {
        SqliteQueue::fail_task(self, task_id, error_message, retry)
    }

    fn renew_lease(&self, task_id: i64, lease_seconds: i64) -> Result<bool, QueueError> {
        SqliteQueue::renew_lease(self, task_id, lease_seconds)
    }

    fn register_worker(&self, worker_id: &str, capabilities: &Value) -> Result<(), QueueError> {
        SqliteQueue::register_worker(self, worker_id, capabilities)
    }

    fn update_heartbeat(&self, worker_id: &str) -> Result<bool, QueueError> {
        SqliteQueue::update_heartbeat(self, worker_id)
    }

    fn remove_worker(&self, worker_id: &str) -> Result<bool, QueueError> {
        SqliteQueue::remove_worker(self, worker_id)
    }
}

/// Map a full task row to a [`Task`].
pub(crate) fn map_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get("status")?;
    let status: TaskStatus = status_raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Task {
        id: row.get("id")?,
        task_type: row.get("type")?,
        priority: row.get("priority")?,
        payload: json_col(row, "payload")?,
        compatibility: json_col(row, "compatibility")?,
        status,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        run_after_utc: ts_col(row, "run_after_utc")?,
        lease_until_utc: ts_col(row, "lease_until_utc")?,
        reserved_at_utc: ts_col(row, "reserved_at_utc")?,
        processing_started_utc: ts_col(row, "processing_started_utc")?,
        finished_at_utc: ts_col(row, "finished_at_utc")?,
        locked_by: row.get("locked_by")?,
        error_message: row.get("error_message")?,
        idempotency_key: row.get("idempotency_key")?,
        created_at_utc: ts_col(row, "created_at_utc")?,
        updated_at_utc: ts_col(row, "updated_at_utc")?,
    })
}

fn ts_col(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    match raw {
        None => Ok(None),
        Some(text) => parse_utc(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn json_col(row: &Row<'_>, column: &str) -> rusqlite::Result<Value> {
    let raw: String = row.get(column)?;
    Ok(serde_json::from_str(&raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new())))
}

/// Classify a rusqlite error into the queue taxonomy. Lock contention maps to
/// the retryable [`QueueError::Busy`]; everything else is a database error.
pub(crate) fn map_sqlite_err(error: rusqlite::Error) -> QueueError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &error {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return QueueError::Busy {
                message: error.to_string(),
            };
        }
    }
    QueueError::Database {
        message: error.to_string(),
    }
}

fn map_enqueue_err(error: rusqlite::Error, idempotency_key: Option<&str>) -> QueueError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &error {
        if failure.code == ErrorCode::ConstraintViolation && message.contains("idempotency") {
            if let Some(key) = idempotency_key {
                return QueueError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                };
            }
        }
    }
    map_sqlite_err(error)
}
