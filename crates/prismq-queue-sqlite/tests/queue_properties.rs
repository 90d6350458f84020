//! Cross-cutting queue properties under concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use prismq_core::{
    ClaimRequest, NewTask, QueueError, SchedulingStrategy, TaskStatus, TaskStore,
};
use prismq_testing::TestQueue;

#[test]
fn test_concurrent_claimers_never_share_a_task() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();

    let total = 50;
    for i in 0..total {
        queue
            .enqueue(&NewTask::new("t", json!({ "i": i })))
            .unwrap();
    }

    let mut joins = Vec::new();
    for worker in 0..4 {
        let queue = fixture.queue();
        joins.push(std::thread::spawn(move || {
            let worker_id = format!("worker-{worker}");
            let mut claimed = Vec::new();
            loop {
                let request =
                    ClaimRequest::new(worker_id.clone(), 60).strategy(SchedulingStrategy::Fifo);
                match queue.claim_task(&request) {
                    Ok(Some(task)) => claimed.push(task.id),
                    Ok(None) => break,
                    // Busy is retryable contention, not a failure.
                    Err(QueueError::Busy { .. }) => continue,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for join in joins {
        all_claimed.extend(join.join().unwrap());
    }

    assert_eq!(all_claimed.len(), total, "every task claimed exactly once");
    let distinct: HashSet<i64> = all_claimed.iter().copied().collect();
    assert_eq!(distinct.len(), total, "duplicate claim observed");
}

#[test]
fn test_idempotency_key_unique_under_concurrent_enqueue() {
    let fixture = TestQueue::fast_retry();

    let mut joins = Vec::new();
    for _ in 0..8 {
        let queue = fixture.queue();
        joins.push(std::thread::spawn(move || {
            queue.enqueue(&NewTask::new("t", json!({})).idempotency_key("shared-key"))
        }));
    }

    let mut successes = 0;
    let mut duplicates = 0;
    for join in joins {
        match join.join().unwrap() {
            Ok(_) => successes += 1,
            Err(QueueError::DuplicateIdempotencyKey { key }) => {
                assert_eq!(key, "shared-key");
                duplicates += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(duplicates, 7);
}

#[test]
fn test_enqueue_claim_complete_drains_under_every_strategy() {
    for strategy in [
        SchedulingStrategy::Fifo,
        SchedulingStrategy::Lifo,
        SchedulingStrategy::Priority,
        SchedulingStrategy::WeightedRandom,
    ] {
        let fixture = TestQueue::fast_retry();
        let queue = fixture.queue();

        let mut ids = HashSet::new();
        for i in 0..5 {
            ids.insert(
                queue
                    .enqueue(&NewTask::new("t", json!({})).priority(100 - i))
                    .unwrap(),
            );
        }

        let mut completed = HashSet::new();
        loop {
            let request = ClaimRequest::new("worker-drain", 60).strategy(strategy);
            match queue.claim_task(&request).unwrap() {
                None => break,
                Some(task) => {
                    queue.begin_processing(task.id).unwrap();
                    queue.complete_task(task.id).unwrap();
                    assert!(completed.insert(task.id), "task completed twice");
                }
            }
        }

        assert_eq!(completed, ids, "strategy {strategy} did not drain cleanly");
        assert_eq!(
            queue
                .tasks_with_status(TaskStatus::Completed, 100)
                .unwrap()
                .len(),
            5
        );
    }
}

#[test]
fn test_terminal_states_keep_finished_timestamp() {
    let fixture = TestQueue::fast_retry();
    let queue = fixture.queue();

    let ok = queue.enqueue(&NewTask::new("t", json!({}))).unwrap();
    let bad = queue
        .enqueue(&NewTask::new("t", json!({})).max_attempts(1))
        .unwrap();

    for _ in 0..2 {
        let task = queue
            .claim_task(&ClaimRequest::new("w", 60).strategy(SchedulingStrategy::Fifo))
            .unwrap()
            .unwrap();
        if task.id == ok {
            queue.complete_task(task.id).unwrap();
        } else {
            queue.fail_task(task.id, "nope", true).unwrap();
        }
    }

    for id in [ok, bad] {
        let task = queue.task(id).unwrap().unwrap();
        assert!(task.status.is_terminal());
        assert!(task.finished_at_utc.is_some());
        assert!(task.attempts <= task.max_attempts);
    }
}
