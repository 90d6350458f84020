//! Task lifecycle transitions: complete, fail with retry, lease renewal.

use rusqlite::{params, OptionalExtension};

use prismq_core::{backoff_delay_seconds, QueueError};

use crate::store::{instant_after, map_sqlite_err, now_string, SqliteQueue};

/// Persisted `error_message` is capped at this many bytes.
const MAX_ERROR_MESSAGE_LEN: usize = 2000;

impl SqliteQueue {
    /// Record that the handler has begun executing. The row stays `leased`;
    /// `processing_started_utc IS NOT NULL` is the "has begun" marker.
    pub fn begin_processing(&self, task_id: i64) -> Result<bool, QueueError> {
        let now = now_string();
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE task_queue
                     SET processing_started_utc = ?1,
                         updated_at_utc = ?1
                     WHERE id = ?2
                         AND status IN ('leased', 'processing')",
                    params![now, task_id],
                )
                .map_err(map_sqlite_err)?;
            Ok(changed > 0)
        })
    }

    /// Transition a leased task to `completed`. Returns whether a row was
    /// updated; a task that is not currently leased is left untouched.
    pub fn complete_task(&self, task_id: i64) -> Result<bool, QueueError> {
        let now = now_string();
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE task_queue
                     SET status = 'completed',
                         finished_at_utc = ?1,
                         updated_at_utc = ?1
                     WHERE id = ?2
                         AND status IN ('leased', 'processing')",
                    params![now, task_id],
                )
                .map_err(map_sqlite_err)?;
            Ok(changed > 0)
        })
    }

    /// Record a failure.
    ///
    /// With `retry` and budget remaining, the task is requeued with an
    /// exponential-backoff `run_after_utc`; otherwise it is dead-lettered.
    /// The read-then-write runs in one IMMEDIATE transaction so it is atomic
    /// against reclamation.
    pub fn fail_task(
        &self,
        task_id: i64,
        error_message: &str,
        retry: bool,
    ) -> Result<bool, QueueError> {
        let message = truncate_message(error_message);
        let now = now_string();
        let retry_config = self.retry_config().clone();

        self.with_tx(|tx| {
            let state: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT attempts, max_attempts
                     FROM task_queue
                     WHERE id = ?1 AND status IN ('leased', 'processing')",
                    params![task_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(map_sqlite_err)?;

            let Some((attempts, max_attempts)) = state else {
                return Ok(false);
            };

            let new_attempts = attempts + 1;

            if retry && new_attempts < max_attempts {
                let delay = backoff_delay_seconds(new_attempts as u32, &retry_config);
                let run_after = instant_after(delay);
                tracing::debug!(
                    task_id,
                    attempts = new_attempts,
                    delay_seconds = delay,
                    "task requeued with backoff"
                );
                tx.execute(
                    "UPDATE task_queue
                     SET status = 'queued',
                         attempts = ?1,
                         error_message = ?2,
                         run_after_utc = ?3,
                         lease_until_utc = NULL,
                         locked_by = NULL,
                         reserved_at_utc = NULL,
                         processing_started_utc = NULL,
                         updated_at_utc = ?4
                     WHERE id = ?5",
                    params![new_attempts, message, run_after, now, task_id],
                )
                .map_err(map_sqlite_err)?;
            } else {
                tracing::warn!(
                    task_id,
                    attempts = new_attempts,
                    error = %message,
                    "task dead-lettered"
                );
                tx.execute(
                    "UPDATE task_queue
                     SET status = 'failed',
                         attempts = ?1,
                         error_message = ?2,
                         finished_at_utc = ?3,
                         lease_until_utc = NULL,
                         locked_by = NULL,
                         updated_at_utc = ?3
                     WHERE id = ?4",
                    params![new_attempts, message, now, task_id],
                )
                .map_err(map_sqlite_err)?;
            }

            Ok(true)
        })
    }

    /// Extend the lease to `now + lease_seconds`. Only effective while the
    /// task is leased.
    pub fn renew_lease(&self, task_id: i64, lease_seconds: i64) -> Result<bool, QueueError> {
        let now = now_string();
        let lease_until = instant_after(lease_seconds.max(0) as f64);
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE task_queue
                     SET lease_until_utc = ?1,
                         updated_at_utc = ?2
                     WHERE id = ?3
                         AND status IN ('leased', 'processing')",
                    params![lease_until, now, task_id],
                )
                .map_err(map_sqlite_err)?;
            Ok(changed > 0)
        })
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
