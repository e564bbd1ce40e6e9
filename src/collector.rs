//! Result collection and cleanup after a terminal transition.
//!
//! Drains the tail of the task's output within a bounded window, appends
//! the closing `termination` envelope, packages the working directory into
//! a tar archive in storage, and attaches the archive reference to the task
//! record. Cleanup failures are logged and never change the terminal state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{COMMON_OUTPUT_STREAM, StreamBus, task_output_stream, task_stream_keys};
use crate::db::DbHandle;
use crate::envelope::Envelope;
use crate::errors::RunnerError;
use crate::models::TaskStatus;
use crate::storage::{ArtifactStorage, task_archive_path};

pub struct ResultCollector {
    db: DbHandle,
    bus: Arc<dyn StreamBus>,
    storage: Arc<dyn ArtifactStorage>,
    drain_window: Duration,
}

impl ResultCollector {
    pub fn new(
        db: DbHandle,
        bus: Arc<dyn StreamBus>,
        storage: Arc<dyn ArtifactStorage>,
        drain_window: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            storage,
            drain_window,
        }
    }

    /// Finalize a task that has reached a terminal state.
    pub async fn finalize(
        &self,
        task_id: &str,
        client_id: &str,
        final_status: TaskStatus,
        workdir: Option<&Path>,
    ) {
        // Let in-flight child output land before the closing envelope.
        tokio::time::sleep(self.drain_window).await;

        let termination = Envelope::termination(
            task_id,
            None,
            serde_json::json!({ "status": final_status.as_str() }),
        );
        if let Err(e) = self.append_termination(task_id, &termination).await {
            tracing::warn!(task = %task_id, error = %e, "Failed to append termination envelope");
        }

        if let Some(dir) = workdir {
            match self.archive_workdir(task_id, client_id, dir).await {
                Ok(size) => {
                    tracing::debug!(task = %task_id, size, "Archived task artifacts");
                }
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "Failed to archive task artifacts");
                }
            }
        }
    }

    async fn append_termination(
        &self,
        task_id: &str,
        envelope: &Envelope,
    ) -> Result<(), RunnerError> {
        self.bus
            .xadd(&task_output_stream(task_id), envelope)
            .await?;
        self.bus.xadd(COMMON_OUTPUT_STREAM, envelope).await?;
        Ok(())
    }

    async fn archive_workdir(
        &self,
        task_id: &str,
        client_id: &str,
        workdir: &Path,
    ) -> Result<u64, RunnerError> {
        let dest = task_archive_path(client_id, task_id);
        let size = self.storage.archive_dir(workdir, &dest).await?;
        let id = task_id.to_string();
        self.db
            .call(move |db| {
                db.merge_results(&id, "archive", serde_json::json!("results.tar"))
            })
            .await?;
        Ok(size)
    }

    /// Delete a task's streams (used once the retention window has passed,
    /// or on a forced delete).
    pub async fn delete_streams(&self, task_id: &str) {
        for key in task_stream_keys(task_id) {
            if let Err(e) = self.bus.delete(&key).await {
                tracing::warn!(task = %task_id, key = %key, error = %e, "Failed to delete stream");
            }
        }
    }

    /// Delete a task's stored files and streams (forced or retention
    /// delete).
    pub async fn delete_artifacts(&self, task_id: &str, client_id: &str) {
        if let Err(e) = self
            .storage
            .delete_folder(&crate::storage::task_folder(client_id, task_id))
            .await
        {
            tracing::warn!(task = %task_id, error = %e, "Failed to delete task storage");
        }
        self.delete_streams(task_id).await;
    }
}
