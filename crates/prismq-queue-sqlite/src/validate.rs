//! Deployment validation: schema presence, pragma effects, and row-state
//! consistency.
//!
//! Run after provisioning a queue or before promoting a restored backup.
//! Each check is independent; the report collects every failure instead of
//! stopping at the first.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::params;
use serde::Serialize;

use prismq_core::QueueError;

use crate::store::{map_sqlite_err, SqliteQueue};

const REQUIRED_TABLES: &[&str] = &["task_queue", "workers", "task_logs"];
const REQUIRED_INDEXES: &[&str] = &[
    "ix_task_status_prio_time",
    "ix_task_type_status",
    "ix_task_region",
    "ix_task_format",
    "uq_task_idempotency",
    "ix_logs_task",
];

/// Outcome of one validation check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Full validation report.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|check| !check.passed).collect()
    }
}

/// Validates a queue database against the schema and state invariants.
pub struct QueueValidator {
    queue: Arc<SqliteQueue>,
}

impl QueueValidator {
    pub fn new(queue: Arc<SqliteQueue>) -> Self {
        Self { queue }
    }

    /// Run every check and collect the results.
    pub fn validate_all(&self) -> Result<ValidationReport, QueueError> {
        let checks = vec![
            self.check_connection()?,
            self.check_tables()?,
            self.check_indexes()?,
            self.check_pragmas()?,
            self.check_state_invariants()?,
        ];

        let report = ValidationReport { checks };
        if report.passed() {
            tracing::debug!("queue validation passed");
        } else {
            for failure in report.failures() {
                tracing::warn!(check = failure.name, detail = %failure.detail, "validation failure");
            }
        }
        Ok(report)
    }

    fn check_connection(&self) -> Result<CheckResult, QueueError> {
        let ok = self.queue.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sqlite_err)
        })?;
        Ok(CheckResult {
            name: "connection",
            passed: ok == 1,
            detail: String::new(),
        })
    }

    fn check_tables(&self) -> Result<CheckResult, QueueError> {
        let present = self.object_names("table")?;
        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|table| !present.contains(*table))
            .collect();
        Ok(CheckResult {
            name: "tables",
            passed: missing.is_empty(),
            detail: if missing.is_empty() {
                String::new()
            } else {
                format!("missing tables: {}", missing.join(", "))
            },
        })
    }

    fn check_indexes(&self) -> Result<CheckResult, QueueError> {
        let present = self.object_names("index")?;
        let missing: Vec<&str> = REQUIRED_INDEXES
            .iter()
            .copied()
            .filter(|index| !present.contains(*index))
            .collect();
        Ok(CheckResult {
            name: "indexes",
            passed: missing.is_empty(),
            detail: if missing.is_empty() {
                String::new()
            } else {
                format!("missing indexes: {}", missing.join(", "))
            },
        })
    }

    fn check_pragmas(&self) -> Result<CheckResult, QueueError> {
        let (journal_mode, foreign_keys) = self.queue.read(|conn| {
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(map_sqlite_err)?;
            let foreign_keys: i64 = conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .map_err(map_sqlite_err)?;
            Ok((journal_mode, foreign_keys))
        })?;

        let mut problems = Vec::new();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            problems.push(format!("journal_mode is {journal_mode}, expected wal"));
        }
        if foreign_keys != 1 {
            problems.push("foreign_keys is off".to_string());
        }

        Ok(CheckResult {
            name: "pragmas",
            passed: problems.is_empty(),
            detail: problems.join("; "),
        })
    }

    /// Row-state invariants:
    /// queued rows carry no lease, leased rows carry both lease fields,
    /// terminal rows carry a finish timestamp, and `attempts` never exceeds
    /// `max_attempts`.
    fn check_state_invariants(&self) -> Result<CheckResult, QueueError> {
        let violations = self.queue.read(|conn| {
            let count_where = |predicate: &str| -> Result<i64, QueueError> {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM task_queue WHERE {predicate}"),
                    params![],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)
            };

            let mut violations = Vec::new();
            let queued_with_lease = count_where(
                "status = 'queued' AND (locked_by IS NOT NULL OR lease_until_utc IS NOT NULL)",
            )?;
            if queued_with_lease > 0 {
                violations.push(format!("{queued_with_lease} queued rows hold lease fields"));
            }

            let leased_without_lease = count_where(
                "status IN ('leased', 'processing') \
                 AND (locked_by IS NULL OR lease_until_utc IS NULL)",
            )?;
            if leased_without_lease > 0 {
                violations.push(format!(
                    "{leased_without_lease} leased rows are missing lease fields"
                ));
            }

            let terminal_without_finish = count_where(
                "status IN ('completed', 'failed', 'dead_letter') AND finished_at_utc IS NULL",
            )?;
            if terminal_without_finish > 0 {
                violations.push(format!(
                    "{terminal_without_finish} terminal rows lack finished_at_utc"
                ));
            }

            let over_budget = count_where("attempts > max_attempts")?;
            if over_budget > 0 {
                violations.push(format!("{over_budget} rows exceed max_attempts"));
            }

            Ok(violations)
        })?;

        Ok(CheckResult {
            name: "state_invariants",
            passed: violations.is_empty(),
            detail: violations.join("; "),
        })
    }

    fn object_names(&self, kind: &str) -> Result<HashSet<String>, QueueError> {
        self.queue.read(|conn| {
            let mut statement = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
                .map_err(map_sqlite_err)?;
            let rows = statement
                .query_map(params![kind], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_err)?;
            rows.collect::<rusqlite::Result<HashSet<_>>>()
                .map_err(map_sqlite_err)
        })
    }
}

/// Open the database at `path` and run the full validation.
pub fn quick_validate(path: impl AsRef<std::path::Path>) -> Result<bool, QueueError> {
    let queue = Arc::new(SqliteQueue::open(path)?);
    Ok(QueueValidator::new(queue).validate_all()?.passed())
}
