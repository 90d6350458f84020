//! Data model for queue entities.
//!
//! [`Task`], [`Worker`] and [`TaskLog`] are snapshots of database rows. The
//! store owns the canonical state; mutations go back through the store APIs,
//! never through these structs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution state of a task row.
///
/// Only `Queued` rows are eligible for claim. `Leased` covers the whole
/// execution window; `processing_started_utc` marks that the handler has
/// begun. `Processing` is accepted when reading rows written by other
/// implementations but is never written by this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// The string stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    /// Whether the task can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "leased" => Ok(TaskStatus::Leased),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(UnknownVariant {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

/// Ordering rule used when claiming the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Oldest submission wins (`id ASC`).
    Fifo,
    /// Newest submission wins (`id DESC`); can starve old tasks.
    Lifo,
    /// Urgency first, FIFO within a tier (`priority ASC, id ASC`).
    Priority,
    /// Probabilistic, priority-biased but starvation-resistant.
    WeightedRandom,
}

impl SchedulingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "fifo",
            SchedulingStrategy::Lifo => "lifo",
            SchedulingStrategy::Priority => "priority",
            SchedulingStrategy::WeightedRandom => "weighted_random",
        }
    }
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Priority
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(SchedulingStrategy::Fifo),
            "lifo" => Ok(SchedulingStrategy::Lifo),
            "priority" => Ok(SchedulingStrategy::Priority),
            "weighted_random" => Ok(SchedulingStrategy::WeightedRandom),
            other => Err(UnknownVariant {
                kind: "scheduling strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Error for parsing enum-like column values.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// One persistent unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonically assigned row id.
    pub id: i64,
    /// Task type; matched against the handler registry at dispatch.
    pub task_type: String,
    /// Lower is more urgent. Default 100.
    pub priority: i64,
    /// Opaque JSON payload handed to the handler.
    pub payload: Value,
    /// Worker requirements; reserved for capability filtering, unused at
    /// claim time.
    pub compatibility: Value,
    pub status: TaskStatus,
    /// Attempts consumed so far (failures and lease reclamations count).
    pub attempts: i64,
    pub max_attempts: i64,
    /// Not-before deadline; a queued row in the future is ineligible.
    pub run_after_utc: Option<DateTime<Utc>>,
    pub lease_until_utc: Option<DateTime<Utc>>,
    pub reserved_at_utc: Option<DateTime<Utc>>,
    pub processing_started_utc: Option<DateTime<Utc>>,
    pub finished_at_utc: Option<DateTime<Utc>>,
    /// Owning worker id while leased.
    pub locked_by: Option<String>,
    /// Last failure text, truncated by the store.
    pub error_message: Option<String>,
    /// Producer-supplied duplicate suppression key; globally unique when set.
    pub idempotency_key: Option<String>,
    pub created_at_utc: Option<DateTime<Utc>>,
    pub updated_at_utc: Option<DateTime<Utc>>,
}

impl Task {
    /// Payload as a JSON object, or an empty object when the payload is not
    /// an object.
    pub fn payload_object(&self) -> serde_json::Map<String, Value> {
        match &self.payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }

    /// Compatibility document as a JSON object, or an empty object.
    pub fn compatibility_object(&self) -> serde_json::Map<String, Value> {
        match &self.compatibility {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }

    /// Whether the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A task to be enqueued.
///
/// ```
/// use prismq_core::NewTask;
/// use serde_json::json;
///
/// let task = NewTask::new("echo", json!({ "msg": "hello" }))
///     .priority(10)
///     .idempotency_key("run-42");
/// assert_eq!(task.task_type, "echo");
/// ```
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Value,
    pub compatibility: Value,
    pub priority: i64,
    pub max_attempts: i64,
    pub run_after_utc: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            compatibility: Value::Object(serde_json::Map::new()),
            priority: 100,
            max_attempts: 5,
            run_after_utc: None,
            idempotency_key: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay eligibility until the given instant.
    pub fn run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after_utc = Some(run_after);
        self
    }

    pub fn compatibility(mut self, compatibility: Value) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A registered execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub capabilities: Value,
    pub heartbeat_utc: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn capabilities_object(&self) -> serde_json::Map<String, Value> {
        match &self.capabilities {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(UnknownVariant {
                kind: "log level",
                value: other.to_string(),
            }),
        }
    }
}

/// One entry in a task's diagnostic stream. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub log_id: i64,
    pub task_id: i64,
    pub at_utc: Option<DateTime<Utc>>,
    pub level: LogLevel,
    pub message: Option<String>,
    pub details: Option<Value>,
}
