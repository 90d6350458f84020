//! Error taxonomy for queue operations.
//!
//! Every kind a caller might branch on gets its own variant or type:
//! transient lock contention is retryable, schema failure is fatal at
//! startup, a duplicate idempotency key means "already enqueued".
//!
//! Handler failures travel as [`HandlerError`]: an `anyhow::Error` for
//! ergonomic construction inside handlers, tagged with a [`FailureKind`] so
//! the engine knows whether to retry.

use std::fmt;

use thiserror::Error;

/// Store-level failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Transient lock contention (`SQLITE_BUSY` / `SQLITE_LOCKED`); the
    /// caller should retry with backoff.
    #[error("queue database is busy: {message}")]
    Busy { message: String },

    /// Schema bootstrap failed. Fatal at startup.
    #[error("failed to initialize queue schema: {message}")]
    Schema { message: String },

    /// Any other database failure.
    #[error("queue database error: {message}")]
    Database { message: String },

    /// An enqueue reused a non-null idempotency key. The task is already
    /// enqueued; this is a signal, not a fault.
    #[error("task with idempotency key '{key}' is already enqueued")]
    DuplicateIdempotencyKey { key: String },
}

impl QueueError {
    pub fn database(message: impl fmt::Display) -> Self {
        QueueError::Database {
            message: message.to_string(),
        }
    }

    pub fn schema(message: impl fmt::Display) -> Self {
        QueueError::Schema {
            message: message.to_string(),
        }
    }

    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Busy { .. })
    }
}

/// Handler registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The task's type has no handler; the engine dead-letters such tasks.
    #[error("no handler registered for task type '{task_type}'")]
    NotRegistered { task_type: String },

    /// Duplicate registration without `allow_override`.
    #[error("handler already registered for task type '{task_type}'")]
    AlreadyRegistered { task_type: String },
}

/// Handler manifest loading failures. Fatal at load time: a single bad entry
/// fails the entire load.
#[derive(Debug, Error)]
pub enum HandlerConfigError {
    #[error("handler manifest not found: {path}")]
    NotFound { path: String },

    #[error("unsupported handler manifest format '{extension}' (supported: json, yaml, yml, toml)")]
    UnsupportedFormat { extension: String },

    #[error("invalid handler manifest {path}: {message}")]
    Parse { path: String, message: String },

    #[error("handler manifest entry {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("handler manifest names task type '{task_type}' but no handler is registered for it")]
    UnknownTaskType { task_type: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read handler manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Queue configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    NotFound { path: String },

    #[error("unsupported configuration format '{extension}' (supported: json, yaml, yml, toml)")]
    UnsupportedFormat { extension: String },

    #[error("invalid configuration {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a handler failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; requeue with backoff while the retry budget lasts.
    Retryable,
    /// Permanent; dead-letter immediately.
    NonRetryable,
}

/// Error value returned by task handlers.
///
/// Handlers signal failure explicitly instead of panicking; the engine maps
/// the kind onto `fail(retry = ...)`.
///
/// ```
/// use prismq_core::{FailureKind, HandlerError};
///
/// let err = HandlerError::retryable(anyhow::anyhow!("upstream timed out"));
/// assert_eq!(err.kind(), FailureKind::Retryable);
///
/// let err = HandlerError::fatal(anyhow::anyhow!("malformed payload"));
/// assert_eq!(err.kind(), FailureKind::NonRetryable);
/// ```
#[derive(Debug)]
pub struct HandlerError {
    kind: FailureKind,
    source: anyhow::Error,
}

impl HandlerError {
    /// A transient failure worth retrying.
    pub fn retryable(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            source: source.into(),
        }
    }

    /// A permanent failure; the task goes straight to the dead letter bucket.
    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            source: source.into(),
        }
    }

    /// Shorthand for a retryable failure from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::retryable(anyhow::anyhow!("{message}"))
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FailureKind::Retryable => "retryable",
            FailureKind::NonRetryable => "fatal",
        };
        write!(f, "{kind}: {:#}", self.source)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    /// Bare `anyhow::Error` defaults to retryable, matching the engine's
    /// treatment of uncategorized handler failures.
    fn from(source: anyhow::Error) -> Self {
        HandlerError::retryable(source)
    }
}

/// Result alias for handler invocations.
pub type HandlerResult = Result<(), HandlerError>;
