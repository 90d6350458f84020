//! Schema definitions and pragma tuning.
//!
//! Everything here is idempotent (`CREATE ... IF NOT EXISTS`), so bootstrap
//! can run on every open. Additive migrations append statements; nothing is
//! ever altered in place.

use rusqlite::Connection;

/// Pragma set applied to every new connection.
///
/// Tuned for WAL concurrency: readers proceed while one writer holds the
/// reserved lock, `busy_timeout` absorbs short contention instead of
/// surfacing `SQLITE_BUSY` immediately.
pub const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("busy_timeout", "5000"),
    ("wal_autocheckpoint", "1000"),
    ("foreign_keys", "ON"),
    ("temp_store", "MEMORY"),
    // 128 MiB memory-mapped I/O
    ("mmap_size", "134217728"),
    ("page_size", "4096"),
    // ~20 MiB cache (negative = KiB)
    ("cache_size", "-20000"),
];

const CREATE_TASK_QUEUE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS task_queue (
  id                 INTEGER PRIMARY KEY AUTOINCREMENT,
  type               TEXT NOT NULL,
  priority           INTEGER NOT NULL DEFAULT 100,
  payload            TEXT NOT NULL,
  compatibility      TEXT NOT NULL DEFAULT '{}',

  status             TEXT NOT NULL DEFAULT 'queued',
  attempts           INTEGER NOT NULL DEFAULT 0,
  max_attempts       INTEGER NOT NULL DEFAULT 5,

  run_after_utc      DATETIME NOT NULL DEFAULT (datetime('now')),
  lease_until_utc    DATETIME,
  reserved_at_utc    DATETIME,
  processing_started_utc DATETIME,
  finished_at_utc    DATETIME,

  locked_by          TEXT,
  error_message      TEXT,
  idempotency_key    TEXT,

  created_at_utc     DATETIME NOT NULL DEFAULT (datetime('now')),
  updated_at_utc     DATETIME NOT NULL DEFAULT (datetime('now')),

  -- Generated columns for JSON filtering
  -- region: from compatibility (worker matching), format: from payload (task data)
  region             TEXT GENERATED ALWAYS AS (json_extract(compatibility, '$.region')) VIRTUAL,
  format             TEXT GENERATED ALWAYS AS (json_extract(payload, '$.format')) VIRTUAL
);
";

const CREATE_WORKERS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS workers (
  worker_id      TEXT PRIMARY KEY,
  capabilities   TEXT NOT NULL,
  heartbeat_utc  DATETIME NOT NULL DEFAULT (datetime('now'))
);
";

const CREATE_TASK_LOGS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS task_logs (
  log_id     INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id    INTEGER NOT NULL,
  at_utc     DATETIME NOT NULL DEFAULT (datetime('now')),
  level      TEXT NOT NULL,
  message    TEXT,
  details    TEXT,
  FOREIGN KEY (task_id) REFERENCES task_queue(id)
);
";

// The claim-ordering key: every claim query walks (status, priority,
// run_after_utc, id).
const CREATE_TASK_STATUS_PRIO_TIME_INDEX: &str = "
CREATE INDEX IF NOT EXISTS ix_task_status_prio_time
  ON task_queue (status, priority, run_after_utc, id);
";

const CREATE_TASK_TYPE_STATUS_INDEX: &str = "
CREATE INDEX IF NOT EXISTS ix_task_type_status
  ON task_queue (type, status);
";

const CREATE_TASK_REGION_INDEX: &str = "
CREATE INDEX IF NOT EXISTS ix_task_region
  ON task_queue (region);
";

const CREATE_TASK_FORMAT_INDEX: &str = "
CREATE INDEX IF NOT EXISTS ix_task_format
  ON task_queue (format);
";

const CREATE_TASK_IDEMPOTENCY_INDEX: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS uq_task_idempotency
  ON task_queue (idempotency_key)
  WHERE idempotency_key IS NOT NULL;
";

const CREATE_LOGS_TASK_INDEX: &str = "
CREATE INDEX IF NOT EXISTS ix_logs_task
  ON task_logs (task_id, at_utc);
";

const CREATE_QUEUE_STATUS_SUMMARY_VIEW: &str = "
CREATE VIEW IF NOT EXISTS v_queue_status_summary AS
SELECT
    status,
    COUNT(*) as task_count,
    ROUND(AVG(attempts), 2) as avg_attempts,
    MIN(created_at_utc) as oldest_task,
    MAX(created_at_utc) as newest_task
FROM task_queue
GROUP BY status;
";

const CREATE_QUEUE_TYPE_SUMMARY_VIEW: &str = "
CREATE VIEW IF NOT EXISTS v_queue_type_summary AS
SELECT
    type,
    status,
    COUNT(*) as task_count,
    ROUND(AVG(priority), 2) as avg_priority
FROM task_queue
GROUP BY type, status;
";

const CREATE_WORKER_STATUS_VIEW: &str = "
CREATE VIEW IF NOT EXISTS v_worker_status AS
SELECT
    w.worker_id,
    w.capabilities,
    w.heartbeat_utc,
    COUNT(t.id) as active_tasks,
    ROUND((JULIANDAY('now') - JULIANDAY(w.heartbeat_utc)) * 86400) as seconds_since_heartbeat
FROM workers w
LEFT JOIN task_queue t ON t.locked_by = w.worker_id AND t.status IN ('leased', 'processing')
GROUP BY w.worker_id, w.capabilities, w.heartbeat_utc;
";

const CREATE_TASK_PERFORMANCE_VIEW: &str = "
CREATE VIEW IF NOT EXISTS v_task_performance AS
SELECT
    type,
    status,
    COUNT(*) as task_count,
    ROUND(AVG(JULIANDAY(finished_at_utc) - JULIANDAY(processing_started_utc)) * 86400, 2) as avg_processing_seconds,
    ROUND(AVG(attempts), 2) as avg_attempts
FROM task_queue
WHERE finished_at_utc IS NOT NULL
GROUP BY type, status;
";

const CREATE_RECENT_FAILURES_VIEW: &str = "
CREATE VIEW IF NOT EXISTS v_recent_failures AS
SELECT
    id,
    type,
    status,
    attempts,
    error_message,
    finished_at_utc
FROM task_queue
WHERE status IN ('failed', 'dead_letter')
ORDER BY finished_at_utc DESC
LIMIT 100;
";

/// All schema statements, in creation order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_TASK_QUEUE_TABLE,
    CREATE_WORKERS_TABLE,
    CREATE_TASK_LOGS_TABLE,
    CREATE_TASK_STATUS_PRIO_TIME_INDEX,
    CREATE_TASK_TYPE_STATUS_INDEX,
    CREATE_TASK_REGION_INDEX,
    CREATE_TASK_FORMAT_INDEX,
    CREATE_TASK_IDEMPOTENCY_INDEX,
    CREATE_LOGS_TASK_INDEX,
    CREATE_QUEUE_STATUS_SUMMARY_VIEW,
    CREATE_QUEUE_TYPE_SUMMARY_VIEW,
    CREATE_WORKER_STATUS_VIEW,
    CREATE_TASK_PERFORMANCE_VIEW,
    CREATE_RECENT_FAILURES_VIEW,
];

/// Apply the pragma set to a connection.
pub(crate) fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    for (pragma, value) in PRAGMAS {
        conn.execute_batch(&format!("PRAGMA {pragma} = {value};"))?;
    }
    Ok(())
}

/// Create all tables, indexes and views.
pub(crate) fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute_batch(statement)?;
    }
    Ok(())
}
