//! Worker heartbeat publication.
//!
//! Runs on its own thread, decoupled from the claim loop, so a slow handler
//! never starves the heartbeat. The interval must stay shorter than both the
//! lease duration and the monitor's stale threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use crate::store::TaskStore;

/// Handle to a running heartbeat thread.
pub struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Spawn a thread that upserts the worker row every `interval`.
///
/// Each beat re-registers the worker, so a row deleted by stale-worker
/// cleanup reappears on the next beat. Failed beats are logged and retried
/// on the next tick.
pub fn spawn_heartbeat<S: TaskStore + 'static>(
    store: Arc<S>,
    worker_id: String,
    capabilities: Value,
    interval: Duration,
) -> HeartbeatHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name(format!("heartbeat-{worker_id}"))
        .spawn(move || {
            tracing::debug!(worker_id = %worker_id, ?interval, "heartbeat thread started");
            while !stop_flag.load(Ordering::SeqCst) {
                if let Err(e) = store.register_worker(&worker_id, &capabilities) {
                    tracing::warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
                }
                sleep_interruptibly(&stop_flag, interval);
            }
            tracing::debug!(worker_id = %worker_id, "heartbeat thread stopped");
        })
        .expect("failed to spawn heartbeat thread");

    HeartbeatHandle {
        stop,
        thread: Some(thread),
    }
}

fn sleep_interruptibly(stop: &AtomicBool, duration: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = duration;
    while !stop.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
