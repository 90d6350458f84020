//! Store contract between the worker engine and a queue backend.
//!
//! The store decides what "claimable" means (scheduling order, not-before
//! deadlines, lease bookkeeping). Workers stay dumb: they ask for one task,
//! run it, and report the outcome.
//!
//! # Implementer notes
//!
//! - `claim_task` must be atomic against all other claimers: select one
//!   eligible row and transition it to `leased` in the same statement or
//!   transaction. No two workers may ever observe the same task leased.
//! - Lease expiry is the crash-recovery mechanism; claiming must always set
//!   `lease_until_utc`.
//! - Retry delay calculation belongs to the store, not the worker.

use serde_json::Value;

use crate::error::QueueError;
use crate::model::{SchedulingStrategy, Task};

/// Parameters for a single claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity recorded in `locked_by` while the lease is held.
    pub worker_id: String,
    /// Worker capabilities. Reserved for capability filtering; stores accept
    /// and ignore it today.
    pub capabilities: Value,
    /// Lease length granted on a successful claim.
    pub lease_seconds: i64,
    /// Ordering rule for selecting among eligible rows.
    pub strategy: SchedulingStrategy,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>, lease_seconds: i64) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: Value::Object(serde_json::Map::new()),
            lease_seconds,
            strategy: SchedulingStrategy::default(),
        }
    }

    pub fn strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Operations the worker engine needs from a queue backend.
pub trait TaskStore: Send + Sync {
    /// Atomically claim one eligible task, or return `None` when the queue
    /// has nothing ready. An empty queue is not an error.
    fn claim_task(&self, request: &ClaimRequest) -> Result<Option<Task>, QueueError>;

    /// Record that the handler has begun executing the task. Returns whether
    /// a row was updated.
    fn begin_processing(&self, task_id: i64) -> Result<bool, QueueError>;

    /// Transition a leased task to `completed`. Returns whether a row was
    /// updated; completing a task that is not leased is a no-op.
    fn complete_task(&self, task_id: i64) -> Result<bool, QueueError>;

    /// Record a failure. With `retry` and budget remaining the task is
    /// requeued with backoff; otherwise it is dead-lettered.
    fn fail_task(&self, task_id: i64, error_message: &str, retry: bool)
        -> Result<bool, QueueError>;

    /// Extend the lease on a running task so long handlers keep exclusivity.
    fn renew_lease(&self, task_id: i64, lease_seconds: i64) -> Result<bool, QueueError>;

    /// Upsert the worker row, refreshing capabilities and heartbeat.
    fn register_worker(&self, worker_id: &str, capabilities: &Value) -> Result<(), QueueError>;

    /// Refresh the worker's heartbeat. Returns whether the worker row exists.
    fn update_heartbeat(&self, worker_id: &str) -> Result<bool, QueueError>;

    /// Delete the worker row. Returns whether a row was removed.
    fn remove_worker(&self, worker_id: &str) -> Result<bool, QueueError>;
}
