//! Cancellation controller: the single actor allowed to move a task into
//! CANCELLED.
//!
//! A cancel is recorded first (CAS against whatever active state the task
//! is in), then broadcast on the task's status channel. The worker that
//! owns the process observes the broadcast and delivers SIGTERM to the
//! process group, escalating to SIGKILL after the grace window.

use std::sync::Arc;

use crate::bus::{StreamBus, status_channel};
use crate::db::DbHandle;
use crate::envelope::Envelope;
use crate::errors::RunnerError;
use crate::models::{Task, TaskStatus};

pub struct CancelController {
    db: DbHandle,
    bus: Arc<dyn StreamBus>,
}

impl CancelController {
    pub fn new(db: DbHandle, bus: Arc<dyn StreamBus>) -> Self {
        Self { db, bus }
    }

    /// Cancel a task. Idempotent: a cancel after termination is a no-op
    /// that returns the current record.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, RunnerError> {
        let mut attempts = 0;
        loop {
            let id = task_id.to_string();
            let task = self
                .db
                .call(move |db| db.get_task(&id))
                .await?
                .ok_or_else(|| RunnerError::not_found("Task"))?;
            if task.status.is_terminal() {
                return Ok(task);
            }

            let id = task_id.to_string();
            let from = task.status;
            let result = self
                .db
                .call(move |db| {
                    db.update_task_status(
                        &id,
                        from,
                        TaskStatus::Cancelled,
                        crate::db::StatusPatch {
                            input_request_id: Some(None),
                            results: Some(serde_json::json!({ "detail": "Task cancelled" })),
                        },
                    )
                })
                .await;
            match result {
                Ok(cancelled) => {
                    let envelope = Envelope::status(
                        task_id,
                        TaskStatus::Cancelled,
                        serde_json::json!({ "detail": "Task cancelled" }),
                    );
                    if let Err(e) = self.bus.publish(&status_channel(task_id), &envelope).await {
                        tracing::warn!(task = %task_id, error = %e, "Failed to publish cancellation");
                    }
                    tracing::info!(task = %task_id, "Task cancelled");
                    return Ok(cancelled);
                }
                // The task moved under us (RUNNING <-> WAITING_FOR_INPUT or a
                // terminal race); re-read and try again.
                Err(RunnerError::Conflict(_)) if attempts < 4 => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
