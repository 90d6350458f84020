//! Worker engine: the claim → dispatch → complete/fail loop.
//!
//! One engine drives one worker identity. Claiming, lease bookkeeping and
//! retry policy live in the store; the engine owns dispatch order and the
//! cooperative stop. Heartbeats run on a companion thread (see
//! [`crate::heartbeat`]), deliberately decoupled from the claim loop.
//!
//! ```text
//! queued ──claim──▶ leased ──begin──▶ (handler runs) ──ok──▶ completed
//!                     │                     │
//!                     │                     ├─err, retry─▶ queued (backoff)
//!                     │                     └─err, final─▶ failed
//!                     └─lease expires, monitor reclaim──▶ queued
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::QueueConfig;
use crate::error::{FailureKind, QueueError};
use crate::handler::HandlerRegistry;
use crate::model::SchedulingStrategy;
use crate::store::{ClaimRequest, TaskStore};

/// Tuning for a single worker engine.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub capabilities: serde_json::Value,
    pub strategy: SchedulingStrategy,
    pub lease_seconds: i64,
    /// Idle sleep between empty claims.
    pub poll_interval: Duration,
    /// Consecutive store failures tolerated before the loop aborts.
    pub max_consecutive_errors: u32,
}

impl WorkerOptions {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: serde_json::Value::Object(serde_json::Map::new()),
            strategy: SchedulingStrategy::default(),
            lease_seconds: 60,
            poll_interval: Duration::from_secs(1),
            max_consecutive_errors: 10,
        }
    }

    /// Derive options from a loaded [`QueueConfig`].
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            worker_id: config.resolved_worker_id(),
            capabilities: config.capabilities.clone(),
            strategy: config.scheduling_strategy,
            lease_seconds: config.lease_duration_seconds,
            poll_interval: Duration::from_secs_f64(config.poll_interval_seconds.max(0.0)),
            max_consecutive_errors: 10,
        }
    }

    pub fn strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn lease_seconds(mut self, lease_seconds: i64) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// No eligible task; the loop sleeps one poll interval.
    Idle,
    /// A task was claimed and driven to a transition.
    Busy,
}

/// Totals reported by a finished run loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub processed: u64,
}

/// Terminal failures of the run loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] QueueError),

    /// Safety stop: the store failed on this many consecutive iterations.
    #[error("worker stopping after {count} consecutive store errors: {last}")]
    TooManyConsecutiveErrors { count: u32, last: QueueError },
}

/// Cooperative stop signal shared with the run loop.
///
/// Stopping is honored between iterations; an in-flight handler is never
/// interrupted.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Claim-dispatch-complete loop for one worker identity.
pub struct WorkerEngine<S: TaskStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
}

impl<S: TaskStore> WorkerEngine<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, options: WorkerOptions) -> Self {
        Self {
            store,
            registry,
            options,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Claim one task and drive it to a transition.
    ///
    /// Returns [`Iteration::Idle`] when nothing is eligible. Handler failures
    /// are not errors here; they are recorded against the task and the
    /// iteration still counts as busy.
    pub fn claim_and_process(&self) -> Result<Iteration, QueueError> {
        let request = ClaimRequest {
            worker_id: self.options.worker_id.clone(),
            capabilities: self.options.capabilities.clone(),
            lease_seconds: self.options.lease_seconds,
            strategy: self.options.strategy,
        };

        let Some(task) = self.store.claim_task(&request)? else {
            return Ok(Iteration::Idle);
        };

        tracing::debug!(
            task_id = task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            "claimed task"
        );

        self.store.begin_processing(task.id)?;

        let registered = match self.registry.get(&task.task_type) {
            Ok(registered) => registered,
            Err(e) => {
                // Unknown type can never succeed; dead-letter immediately.
                tracing::warn!(task_id = task.id, task_type = %task.task_type, "no handler");
                self.store.fail_task(task.id, &e.to_string(), false)?;
                return Ok(Iteration::Busy);
            }
        };

        match registered.handler.handle(&task) {
            Ok(()) => {
                self.store.complete_task(task.id)?;
                tracing::info!(task_id = task.id, task_type = %task.task_type, "task completed");
            }
            Err(err) => {
                let retry = err.kind() == FailureKind::Retryable;
                let message = err.to_string();
                tracing::warn!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    retry,
                    error = %message,
                    "task failed"
                );
                self.store.fail_task(task.id, &message, retry)?;
            }
        }

        Ok(Iteration::Busy)
    }

    /// Run until stopped or `max_iterations` is reached.
    ///
    /// Registers the worker row first, sleeps the poll interval when idle,
    /// and aborts with [`EngineError::TooManyConsecutiveErrors`] when the
    /// store keeps failing.
    pub fn run_loop(&self, max_iterations: Option<u64>) -> Result<RunSummary, EngineError> {
        self.store
            .register_worker(&self.options.worker_id, &self.options.capabilities)?;

        tracing::info!(
            worker_id = %self.options.worker_id,
            strategy = %self.options.strategy,
            "worker loop started"
        );

        let mut summary = RunSummary::default();
        let mut consecutive_errors: u32 = 0;

        while !self.stop.load(Ordering::SeqCst) {
            if let Some(cap) = max_iterations {
                if summary.iterations >= cap {
                    break;
                }
            }
            summary.iterations += 1;

            match self.claim_and_process() {
                Ok(Iteration::Busy) => {
                    consecutive_errors = 0;
                    summary.processed += 1;
                }
                Ok(Iteration::Idle) => {
                    consecutive_errors = 0;
                    self.sleep_interruptibly(self.options.poll_interval);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        worker_id = %self.options.worker_id,
                        consecutive_errors,
                        error = %e,
                        "store error in worker loop"
                    );
                    if consecutive_errors >= self.options.max_consecutive_errors {
                        return Err(EngineError::TooManyConsecutiveErrors {
                            count: consecutive_errors,
                            last: e,
                        });
                    }
                    self.sleep_interruptibly(self.options.poll_interval);
                }
            }
        }

        tracing::info!(
            worker_id = %self.options.worker_id,
            iterations = summary.iterations,
            processed = summary.processed,
            "worker loop stopped"
        );
        Ok(summary)
    }

    /// Sleep up to `duration`, waking early when stopped.
    fn sleep_interruptibly(&self, duration: Duration) {
        let slice = Duration::from_millis(50);
        let mut remaining = duration;
        while !self.stop.load(Ordering::SeqCst) && remaining > Duration::ZERO {
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}
