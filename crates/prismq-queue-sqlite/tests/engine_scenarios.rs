//! End-to-end worker engine scenarios against the SQLite store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use prismq_core::{
    HandlerError, HandlerRegistry, NewTask, SchedulingStrategy, Task, TaskStatus, WorkerEngine,
    WorkerOptions,
};
use prismq_queue_sqlite::SqliteQueue;
use prismq_testing::{
    test_worker_id, wait_for, AlwaysFailsHandler, CountingHandler, FlakyHandler, TestQueue,
};

fn engine(
    queue: Arc<SqliteQueue>,
    registry: Arc<HandlerRegistry>,
    strategy: SchedulingStrategy,
) -> WorkerEngine<SqliteQueue> {
    let options = WorkerOptions::new(test_worker_id())
        .strategy(strategy)
        .lease_seconds(60)
        .poll_interval(Duration::from_millis(20));
    WorkerEngine::new(queue, registry, options)
}

fn run_until<F: Fn() -> bool>(engine: WorkerEngine<SqliteQueue>, done: F) -> bool {
    let stop = engine.stop_handle();
    let handle = std::thread::spawn(move || engine.run_loop(None));
    let finished = wait_for(Duration::from_secs(10), done);
    stop.stop();
    handle.join().unwrap().unwrap();
    finished
}

#[test]
fn test_single_worker_happy_path() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();
    let task_id = queue
        .enqueue(&NewTask::new("echo", json!({ "msg": "hello" })).priority(100))
        .unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_handler = Arc::clone(&handled);
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_fn("echo", move |task: &Task| {
            assert_eq!(task.payload["msg"], "hello");
            handled_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, registry, SchedulingStrategy::Fifo),
        move || {
            queue_probe
                .task(task_id)
                .unwrap()
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        },
    );
    assert!(finished, "task never completed");

    let task = fixture.queue.task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 0);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(task.finished_at_utc.is_some());
    assert!(task.processing_started_utc.is_some());
}

#[test]
fn test_retry_then_succeed_applies_growing_backoff() {
    // 10 ms base delay, multiplier 2, zero jitter.
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();
    let task_id = queue
        .enqueue(&NewTask::new("flaky", json!({})).max_attempts(5))
        .unwrap();

    let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let invocations_in_handler = Arc::clone(&invocations);
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_fn("flaky", move |_task: &Task| {
            let mut calls = invocations_in_handler.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() <= 2 {
                Err(HandlerError::retryable(anyhow::anyhow!(
                    "flaky failure {}",
                    calls.len()
                )))
            } else {
                Ok(())
            }
        })
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, registry, SchedulingStrategy::Fifo),
        move || {
            queue_probe
                .task(task_id)
                .unwrap()
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        },
    );
    assert!(finished, "task never completed");

    let task = fixture.queue.task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);

    let calls = invocations.lock().unwrap();
    assert_eq!(calls.len(), 3);
    // Backoff between executions: >= 10 ms after the first failure, >= 20 ms
    // after the second.
    assert!(calls[1] - calls[0] >= Duration::from_millis(10));
    assert!(calls[2] - calls[1] >= Duration::from_millis(20));
}

#[test]
fn test_doomed_task_dead_letters_with_error_text() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();
    let task_id = queue
        .enqueue(&NewTask::new("doomed", json!({})).max_attempts(2))
        .unwrap();

    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(
            "doomed",
            AlwaysFailsHandler::new("disk on fire"),
            "always fails",
            "1.0.0",
            false,
        )
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, registry, SchedulingStrategy::Fifo),
        move || {
            queue_probe
                .task(task_id)
                .unwrap()
                .map(|t| t.status == TaskStatus::Failed)
                .unwrap_or(false)
        },
    );
    assert!(finished, "task never dead-lettered");

    let task = fixture.queue.task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.max_attempts, 2);
    assert!(task.error_message.unwrap().contains("disk on fire"));
}

#[test]
fn test_unknown_type_dead_letters_without_retry() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();
    let task_id = queue
        .enqueue(&NewTask::new("unregistered", json!({})).max_attempts(5))
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, Arc::new(HandlerRegistry::new()), SchedulingStrategy::Fifo),
        move || {
            queue_probe
                .task(task_id)
                .unwrap()
                .map(|t| t.status == TaskStatus::Failed)
                .unwrap_or(false)
        },
    );
    assert!(finished);

    let task = fixture.queue.task(task_id).unwrap().unwrap();
    // One attempt consumed, no retries despite the remaining budget.
    assert_eq!(task.attempts, 1);
    assert!(task
        .error_message
        .unwrap()
        .contains("no handler registered"));
}

#[test]
fn test_three_workers_process_ten_tasks_exactly_once() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();

    let mut expected_ids = Vec::new();
    for i in 0..10 {
        expected_ids.push(
            queue
                .enqueue(&NewTask::new("count", json!({ "i": i })))
                .unwrap(),
        );
    }

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(HandlerRegistry::new());
    let seen_in_handler = Arc::clone(&seen);
    registry
        .register_fn("count", move |task: &Task| {
            seen_in_handler.lock().unwrap().push(task.id);
            // A little work so claims interleave across workers.
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        })
        .unwrap();

    let mut stops = Vec::new();
    let mut joins = Vec::new();
    for _ in 0..3 {
        let engine = engine(
            fixture.queue(),
            Arc::clone(&registry),
            SchedulingStrategy::Fifo,
        );
        stops.push(engine.stop_handle());
        joins.push(std::thread::spawn(move || engine.run_loop(None)));
    }

    let queue_probe = fixture.queue();
    let all_done = wait_for(Duration::from_secs(15), move || {
        queue_probe
            .tasks_with_status(TaskStatus::Completed, 100)
            .unwrap()
            .len()
            == 10
    });

    for stop in &stops {
        stop.stop();
    }
    for join in joins {
        join.join().unwrap().unwrap();
    }
    assert!(all_done, "not all tasks completed");

    // Exactly ten distinct claims across the worker pool.
    let mut claimed = seen.lock().unwrap().clone();
    claimed.sort_unstable();
    assert_eq!(claimed.len(), 10, "duplicate or missing claims: {claimed:?}");
    claimed.dedup();
    assert_eq!(claimed, {
        let mut ids = expected_ids.clone();
        ids.sort_unstable();
        ids
    });
}

#[test]
fn test_scripted_handlers_drive_mixed_outcomes() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();
    let flaky_id = queue
        .enqueue(&NewTask::new("flaky-once", json!({})).max_attempts(5))
        .unwrap();
    let steady_id = fixture.enqueue_simple("steady");

    let flaky = FlakyHandler::new(1);
    let steady = CountingHandler::new();
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register("flaky-once", flaky.clone(), "", "1.0.0", false)
        .unwrap();
    registry
        .register("steady", steady.clone(), "", "1.0.0", false)
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, registry, SchedulingStrategy::Fifo),
        move || {
            queue_probe
                .tasks_with_status(TaskStatus::Completed, 10)
                .unwrap()
                .len()
                == 2
        },
    );
    assert!(finished);

    assert_eq!(flaky.calls(), 2);
    assert_eq!(steady.calls(), 1);
    assert_eq!(
        fixture.queue.task(flaky_id).unwrap().unwrap().attempts,
        1
    );
    assert_eq!(fixture.queue.task(steady_id).unwrap().unwrap().attempts, 0);
}

#[test]
fn test_priority_claim_order_scenario() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();

    let first = queue
        .enqueue(&NewTask::new("p", json!({})).priority(100))
        .unwrap();
    let second = queue
        .enqueue(&NewTask::new("p", json!({})).priority(10))
        .unwrap();
    let third = queue
        .enqueue(&NewTask::new("p", json!({})).priority(50))
        .unwrap();

    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let order_in_handler = Arc::clone(&order);
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_fn("p", move |task: &Task| {
            order_in_handler.lock().unwrap().push(task.id);
            Ok(())
        })
        .unwrap();

    let queue_probe = fixture.queue();
    let finished = run_until(
        engine(queue, registry, SchedulingStrategy::Priority),
        move || {
            queue_probe
                .tasks_with_status(TaskStatus::Completed, 10)
                .unwrap()
                .len()
                == 3
        },
    );
    assert!(finished);

    assert_eq!(*order.lock().unwrap(), vec![second, third, first]);
}
