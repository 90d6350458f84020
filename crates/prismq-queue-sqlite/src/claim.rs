//! Scheduling strategies: atomic task claiming.
//!
//! Every strategy runs the same statement — select one eligible row, flip it
//! to `leased`, return it — inside a `BEGIN IMMEDIATE` transaction. The only
//! degree of freedom is the ORDER BY clause, so no two workers can ever claim
//! the same row regardless of strategy mix.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use prismq_core::{QueueError, SchedulingStrategy, Task};

use crate::store::{
    format_utc, map_sqlite_err, map_task_row, now_string, SqliteQueue, TASK_COLUMNS,
};

/// A task-selection strategy.
///
/// `capabilities` is reserved for future capability filtering and is not
/// consulted today.
pub trait TaskClaimer: Send + Sync {
    /// The ORDER BY clause ranking eligible rows.
    fn order_by(&self) -> &'static str;

    /// Atomically claim one task for `worker_id`, or `None` when nothing is
    /// eligible.
    fn claim_task(
        &self,
        queue: &SqliteQueue,
        worker_id: &str,
        _capabilities: &Value,
        lease_seconds: i64,
    ) -> Result<Option<Task>, QueueError> {
        queue.claim_with_order(self.order_by(), worker_id, lease_seconds)
    }
}

/// Oldest submission first. Fair where submission order matters.
pub struct FifoClaimer;

impl TaskClaimer for FifoClaimer {
    fn order_by(&self) -> &'static str {
        "id ASC"
    }
}

/// Newest submission first. Latest-request-wins semantics; can starve old
/// tasks under steady inflow.
pub struct LifoClaimer;

impl TaskClaimer for LifoClaimer {
    fn order_by(&self) -> &'static str {
        "id DESC"
    }
}

/// Lowest priority number first, FIFO within a tier.
pub struct PriorityClaimer;

impl TaskClaimer for PriorityClaimer {
    fn order_by(&self) -> &'static str {
        "priority ASC, id ASC"
    }
}

/// Probabilistic selection weighted by `1 / (priority + 1)`.
///
/// Urgent tasks win more often but every queued task keeps a nonzero chance,
/// so nothing starves. `ABS` matters: SQLite's `RANDOM()` is a signed 64-bit
/// draw, and scaling a sign-symmetric draw cancels the weight out.
pub struct WeightedRandomClaimer;

impl TaskClaimer for WeightedRandomClaimer {
    fn order_by(&self) -> &'static str {
        "ABS(RANDOM()) * (1.0 / (priority + 1)) DESC"
    }
}

/// Construct the claimer for a strategy tag.
pub fn claimer_for(strategy: SchedulingStrategy) -> &'static dyn TaskClaimer {
    match strategy {
        SchedulingStrategy::Fifo => &FifoClaimer,
        SchedulingStrategy::Lifo => &LifoClaimer,
        SchedulingStrategy::Priority => &PriorityClaimer,
        SchedulingStrategy::WeightedRandom => &WeightedRandomClaimer,
    }
}

impl SqliteQueue {
    /// The shared claim statement: pick one eligible row under `order_by`,
    /// lease it, and return the updated row.
    pub(crate) fn claim_with_order(
        &self,
        order_by: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Task>, QueueError> {
        let now = now_string();
        let lease_until = format_utc(
            chrono::Utc::now() + chrono::Duration::seconds(lease_seconds.max(0)),
        );

        let sql = format!(
            "WITH candidate AS (
                SELECT id
                FROM task_queue
                WHERE status = 'queued'
                    AND run_after_utc <= ?1
                ORDER BY {order_by}
                LIMIT 1
            )
            UPDATE task_queue
            SET status = 'leased',
                reserved_at_utc = ?1,
                lease_until_utc = ?2,
                locked_by = ?3,
                updated_at_utc = ?1
            WHERE id = (SELECT id FROM candidate)
            RETURNING {TASK_COLUMNS}"
        );

        let claimed = self.with_tx(|tx| {
            tx.query_row(&sql, params![now, lease_until, worker_id], map_task_row)
                .optional()
                .map_err(map_sqlite_err)
        })?;

        if let Some(task) = &claimed {
            tracing::debug!(
                task_id = task.id,
                task_type = %task.task_type,
                worker_id,
                lease_until = %lease_until,
                "task leased"
            );
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prismq_core::{NewTask, TaskStatus};
    use serde_json::json;

    fn open_queue() -> (tempfile::TempDir, SqliteQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = SqliteQueue::open(dir.path().join("queue.db")).unwrap();
        (dir, queue)
    }

    fn enqueue(queue: &SqliteQueue, priority: i64) -> i64 {
        queue
            .enqueue(&NewTask::new("t", json!({})).priority(priority))
            .unwrap()
    }

    fn claim(queue: &SqliteQueue, strategy: SchedulingStrategy) -> Option<Task> {
        claimer_for(strategy)
            .claim_task(queue, "worker-1", &json!({}), 60)
            .unwrap()
    }

    #[test]
    fn test_fifo_claims_oldest_first() {
        let (_dir, queue) = open_queue();
        let first = enqueue(&queue, 100);
        let second = enqueue(&queue, 100);

        assert_eq!(claim(&queue, SchedulingStrategy::Fifo).unwrap().id, first);
        assert_eq!(claim(&queue, SchedulingStrategy::Fifo).unwrap().id, second);
        assert!(claim(&queue, SchedulingStrategy::Fifo).is_none());
    }

    #[test]
    fn test_lifo_claims_newest_first() {
        let (_dir, queue) = open_queue();
        let first = enqueue(&queue, 100);
        let second = enqueue(&queue, 100);

        assert_eq!(claim(&queue, SchedulingStrategy::Lifo).unwrap().id, second);
        assert_eq!(claim(&queue, SchedulingStrategy::Lifo).unwrap().id, first);
    }

    #[test]
    fn test_lifo_starves_old_tasks_under_inflow() {
        let (_dir, queue) = open_queue();
        let old = enqueue(&queue, 100);

        // Steady inflow: a new task arrives before each claim.
        for _ in 0..5 {
            let newest = enqueue(&queue, 100);
            let claimed = claim(&queue, SchedulingStrategy::Lifo).unwrap();
            assert_eq!(claimed.id, newest);
            assert_ne!(claimed.id, old);
        }

        let old_task = queue.task(old).unwrap().unwrap();
        assert_eq!(old_task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_priority_orders_by_urgency_then_id() {
        let (_dir, queue) = open_queue();
        let low = enqueue(&queue, 100);
        let urgent = enqueue(&queue, 10);
        let middle = enqueue(&queue, 50);

        assert_eq!(claim(&queue, SchedulingStrategy::Priority).unwrap().id, urgent);
        assert_eq!(claim(&queue, SchedulingStrategy::Priority).unwrap().id, middle);
        assert_eq!(claim(&queue, SchedulingStrategy::Priority).unwrap().id, low);
    }

    #[test]
    fn test_claim_sets_lease_fields() {
        let (_dir, queue) = open_queue();
        enqueue(&queue, 100);

        let task = claim(&queue, SchedulingStrategy::Fifo).unwrap();
        assert_eq!(task.status, TaskStatus::Leased);
        assert_eq!(task.locked_by.as_deref(), Some("worker-1"));
        let lease_until = task.lease_until_utc.unwrap();
        let reserved_at = task.reserved_at_utc.unwrap();
        let granted = (lease_until - reserved_at).num_seconds();
        assert!((59..=61).contains(&granted), "lease length {granted}");
    }

    #[test]
    fn test_future_run_after_is_not_claimed() {
        let (_dir, queue) = open_queue();
        queue
            .enqueue(
                &NewTask::new("delayed", json!({}))
                    .run_after(chrono::Utc::now() + chrono::Duration::seconds(1)),
            )
            .unwrap();

        assert!(claim(&queue, SchedulingStrategy::Fifo).is_none());

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(claim(&queue, SchedulingStrategy::Fifo).is_some());
    }

    #[test]
    fn test_past_run_after_is_claimed() {
        let (_dir, queue) = open_queue();
        queue
            .enqueue(
                &NewTask::new("ready", json!({}))
                    .run_after(chrono::Utc::now() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        assert!(claim(&queue, SchedulingStrategy::Fifo).is_some());
    }

    #[test]
    fn test_leased_task_is_not_claimed_again() {
        let (_dir, queue) = open_queue();
        enqueue(&queue, 100);

        let first = claimer_for(SchedulingStrategy::Fifo)
            .claim_task(&queue, "worker-a", &json!({}), 60)
            .unwrap();
        assert!(first.is_some());

        let second = claimer_for(SchedulingStrategy::Fifo)
            .claim_task(&queue, "worker-b", &json!({}), 60)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_weighted_random_prefers_urgent_tasks() {
        let (_dir, queue) = open_queue();
        let urgent = enqueue(&queue, 0);
        let relaxed = enqueue(&queue, 1);

        // Weights 1.0 vs 0.5; the urgent row should win clearly more than
        // half of independent two-row draws.
        let trials = 400;
        let mut urgent_first = 0;
        for _ in 0..trials {
            let claimed = claim(&queue, SchedulingStrategy::WeightedRandom).unwrap();
            if claimed.id == urgent {
                urgent_first += 1;
            }
            // Reset both rows to queued for the next draw.
            queue
                .with_tx(|tx| {
                    tx.execute(
                        "UPDATE task_queue SET status = 'queued', locked_by = NULL,
                         lease_until_utc = NULL, reserved_at_utc = NULL
                         WHERE id IN (?1, ?2)",
                        params![urgent, relaxed],
                    )
                    .map_err(map_sqlite_err)
                })
                .unwrap();
        }

        let fraction = urgent_first as f64 / trials as f64;
        assert!(
            (0.60..=0.90).contains(&fraction),
            "urgent-first fraction out of range: {fraction}"
        );
    }
}
