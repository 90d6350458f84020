//! Testing utilities for the PrismQ task queue.
//!
//! Temp-directory queue fixtures and scripted handlers for exercising the
//! retry and dead-letter paths without real workloads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use prismq_core::{HandlerError, HandlerResult, NewTask, RetryConfig, Task};
use prismq_queue_sqlite::{QueueOptions, SqliteQueue};

/// A queue backed by a temp directory. The directory lives as long as the
/// fixture; dropping it deletes the database and any backups next to it.
pub struct TestQueue {
    pub queue: Arc<SqliteQueue>,
    dir: tempfile::TempDir,
}

impl TestQueue {
    /// Open a fresh queue with the default retry policy.
    pub fn new() -> Self {
        Self::with_retry(RetryConfig::default())
    }

    /// Open a fresh queue with fast, deterministic retries
    /// (10 ms base delay, zero jitter).
    pub fn fast_retry() -> Self {
        Self::with_retry(RetryConfig::immediate())
    }

    pub fn with_retry(retry: RetryConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let queue = SqliteQueue::open_with_options(
            dir.path().join("queue.db"),
            QueueOptions { retry },
        )
        .expect("open queue");
        Self {
            queue: Arc::new(queue),
            dir,
        }
    }

    pub fn queue(&self) -> Arc<SqliteQueue> {
        Arc::clone(&self.queue)
    }

    /// Directory holding the database file.
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Enqueue a task with an empty payload.
    pub fn enqueue_simple(&self, task_type: &str) -> i64 {
        self.queue
            .enqueue(&NewTask::new(task_type, json!({})))
            .expect("enqueue")
    }

    /// Enqueue a task with the given payload.
    pub fn enqueue_payload(&self, task_type: &str, payload: Value) -> i64 {
        self.queue
            .enqueue(&NewTask::new(task_type, payload))
            .expect("enqueue")
    }
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A unique worker id for tests.
pub fn test_worker_id() -> String {
    format!("worker-test-{}", uuid::Uuid::new_v4())
}

/// Poll `condition` until it holds or `timeout` elapses. Returns whether the
/// condition became true.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Handler that succeeds and counts invocations.
#[derive(Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl prismq_core::TaskHandler for CountingHandler {
    fn handle(&self, _task: &Task) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that fails the first `fail_times` invocations, then succeeds.
pub struct FlakyHandler {
    fail_times: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(fail_times: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_times,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl prismq_core::TaskHandler for FlakyHandler {
    fn handle(&self, _task: &Task) -> HandlerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Err(HandlerError::retryable(anyhow::anyhow!(
                "flaky failure {} of {}",
                call + 1,
                self.fail_times
            )))
        } else {
            Ok(())
        }
    }
}

/// Handler that always fails with the given message.
pub struct AlwaysFailsHandler {
    message: String,
}

impl AlwaysFailsHandler {
    pub fn new(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
        })
    }
}

impl prismq_core::TaskHandler for AlwaysFailsHandler {
    fn handle(&self, _task: &Task) -> HandlerResult {
        Err(HandlerError::retryable(anyhow::anyhow!(
            "{}",
            self.message
        )))
    }
}

/// Handler that sleeps, for lease-timing scenarios.
pub struct SleepingHandler {
    pub duration: Duration,
}

impl prismq_core::TaskHandler for SleepingHandler {
    fn handle(&self, _task: &Task) -> HandlerResult {
        std::thread::sleep(self.duration);
        Ok(())
    }
}
