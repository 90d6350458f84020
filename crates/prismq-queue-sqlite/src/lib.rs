//! SQLite implementation of the PrismQ task queue.
//!
//! This crate provides the production store behind the `TaskStore` trait
//! from `prismq-core`, backed by a single database file.
//!
//! # Features
//!
//! - Atomic claiming via one CTE `UPDATE ... RETURNING` statement per
//!   scheduling strategy (FIFO, LIFO, priority, weighted-random)
//! - `BEGIN IMMEDIATE` write transactions; WAL mode for concurrent readers
//! - Exponential backoff retry with a dead-letter terminal state
//! - Worker heartbeats, stale detection, and lease reclamation
//! - Read-only metrics (depths, rates, percentiles, worker activity)
//! - Online page-batched backup with integrity verification
//! - Checkpoint / vacuum / analyze maintenance and retention cleanup
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use prismq_core::{ClaimRequest, NewTask, SchedulingStrategy, TaskStore};
//! use prismq_queue_sqlite::SqliteQueue;
//! use serde_json::json;
//!
//! let queue = Arc::new(SqliteQueue::open("/var/lib/prismq/queue.db")?);
//!
//! // Producer side
//! let task_id = queue.enqueue(
//!     &NewTask::new("echo", json!({ "msg": "hello" })).idempotency_key("run-1"),
//! )?;
//!
//! // Worker side
//! let request = ClaimRequest::new("worker-1", 60).strategy(SchedulingStrategy::Priority);
//! if let Some(task) = queue.claim_task(&request)? {
//!     queue.begin_processing(task.id)?;
//!     // ... run the handler ...
//!     queue.complete_task(task.id)?;
//! }
//! ```

mod backup;
mod claim;
mod executor;
mod logger;
mod maintenance;
mod metrics;
mod monitor;
mod schema;
mod store;
mod validate;

pub use backup::{BackupError, BackupInfo, QueueBackup};
pub use claim::{
    claimer_for, FifoClaimer, LifoClaimer, PriorityClaimer, TaskClaimer, WeightedRandomClaimer,
};
pub use maintenance::{
    CheckpointMode, CheckpointStats, DatabaseStats, MaintenanceError, OptimizeReport,
    QueueMaintenance,
};
pub use logger::TaskLogger;
pub use metrics::{
    HealthSummary, ProcessingPercentiles, QueueMetrics, RetryMetrics, SuccessFailureRates,
    ThroughputMetrics, WorkerActivity,
};
pub use monitor::ReclaimOutcome;
pub use schema::{PRAGMAS, SCHEMA_STATEMENTS};
pub use store::{QueueOptions, SqliteQueue};
pub use validate::{quick_validate, CheckResult, QueueValidator, ValidationReport};
