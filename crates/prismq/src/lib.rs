//! # PrismQ core
//!
//! Contracts for a persistent task queue with lease-based worker
//! orchestration. This crate owns the data model, the store trait, the
//! handler registry, retry policy, configuration and the worker engine;
//! `prismq-queue-sqlite` provides the store.
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │ enqueue()
//!     ▼
//! ┌──────────────┐   claim_task()   ┌──────────────┐
//! │  TaskStore   │◀─────────────────│ WorkerEngine │──▶ HandlerRegistry
//! │ (SQLite impl)│──── Task ───────▶│  run_loop()  │        │
//! └──────────────┘                  └──────────────┘        ▼
//!     ▲    ▲                              │            TaskHandler
//!     │    │ register_worker()            │ complete / fail
//!     │    └──────── heartbeat thread ────┘
//!     └───────────── monitor sweep (reclaims expired leases)
//! ```
//!
//! ## Key invariants
//!
//! 1. **At most one lease** - a task is observed `leased` by exactly one
//!    worker at any instant; claiming is a single atomic transition.
//! 2. **At-least-once execution** - a worker crash surrenders the task via
//!    lease expiry; idempotency keys deduplicate at enqueue, handlers own
//!    idempotent effects.
//! 3. **Bounded retries** - `attempts` never exceeds `max_attempts`; the
//!    final failure lands in the dead-letter bucket with its error text.
//! 4. **Handlers are pure consumers** - they receive a snapshot and report
//!    an outcome; they never write queue tables.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use prismq_core::{HandlerRegistry, QueueConfig, WorkerEngine, WorkerOptions};
//! use prismq_queue_sqlite::SqliteQueue;
//!
//! let config = QueueConfig::load("queue.toml")?;
//! let queue = Arc::new(SqliteQueue::open(config.resolved_db_path())?);
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("echo", |task| {
//!     println!("{}", task.payload);
//!     Ok(())
//! })?;
//!
//! let engine = WorkerEngine::new(queue, registry, WorkerOptions::from_config(&config));
//! engine.run_loop(None)?;
//! ```

mod config;
mod engine;
mod error;
mod handler;
mod heartbeat;
mod model;
mod retry;
mod store;

// Re-export model types
pub use model::{
    LogLevel, NewTask, SchedulingStrategy, Task, TaskLog, TaskStatus, UnknownVariant, Worker,
};

// Re-export error types
pub use error::{
    ConfigError, FailureKind, HandlerConfigError, HandlerError, HandlerResult, QueueError,
    RegistryError,
};

// Re-export retry policy
pub use retry::{backoff_delay_seconds, RetryConfig};

// Re-export store contract
pub use store::{ClaimRequest, TaskStore};

// Re-export handler registry
pub use handler::{
    load_handler_manifest, HandlerInfo, HandlerManifest, HandlerManifestEntry, HandlerRegistry,
    RegisteredHandler, TaskHandler,
};

// Re-export configuration
pub use config::{default_db_path, QueueConfig, ENV_PREFIX};

// Re-export engine types
pub use engine::{EngineError, Iteration, RunSummary, StopHandle, WorkerEngine, WorkerOptions};

// Re-export heartbeat
pub use heartbeat::{spawn_heartbeat, HeartbeatHandle};
