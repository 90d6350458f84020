//! Built-in demo handlers.
//!
//! Enough to exercise a queue end to end: an echo, a configurable sleep, and
//! an always-failing type for retry drills. Real deployments register their
//! own handlers before starting the engine.

use std::sync::Arc;
use std::time::Duration;

use prismq_core::{HandlerError, HandlerRegistry, HandlerResult, RegistryError, Task};

fn handle_echo(task: &Task) -> HandlerResult {
    let message = task
        .payload
        .get("msg")
        .and_then(|value| value.as_str())
        .unwrap_or("");
    tracing::info!(task_id = task.id, msg = message, "echo");
    Ok(())
}

fn handle_sleep(task: &Task) -> HandlerResult {
    let millis = task
        .payload
        .get("duration_ms")
        .and_then(|value| value.as_u64())
        .unwrap_or(1000);
    tracing::info!(task_id = task.id, millis, "sleeping");
    std::thread::sleep(Duration::from_millis(millis));
    Ok(())
}

fn handle_always_fail(task: &Task) -> HandlerResult {
    let message = task
        .payload
        .get("message")
        .and_then(|value| value.as_str())
        .unwrap_or("simulated failure");
    Err(HandlerError::retryable(anyhow::anyhow!("{message}")))
}

/// Register the demo handlers.
pub fn register_builtin(registry: &Arc<HandlerRegistry>) -> Result<(), RegistryError> {
    registry.register(
        "echo",
        Arc::new(handle_echo),
        "Logs the payload's msg field",
        "1.0.0",
        false,
    )?;
    registry.register(
        "sleep",
        Arc::new(handle_sleep),
        "Sleeps for payload.duration_ms milliseconds",
        "1.0.0",
        false,
    )?;
    registry.register(
        "always-fail",
        Arc::new(handle_always_fail),
        "Fails every attempt; exercises retry and dead-letter paths",
        "1.0.0",
        false,
    )?;
    Ok(())
}
