//! Periodic reconciler: reaps orphaned tasks, purges expired records, and
//! trims streams.
//!
//! Runs in-process alongside the server, or standalone via the `scheduler`
//! subcommand. Every pass is idempotent; failures are logged and retried on
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::StreamBus;
use crate::db::DbHandle;
use crate::errors::RunnerError;
use crate::models::TaskStatus;
use crate::storage::{ArtifactStorage, task_archive_path, task_folder};

pub struct Reaper {
    db: DbHandle,
    bus: Arc<dyn StreamBus>,
    storage: Arc<dyn ArtifactStorage>,
    retention_days: u64,
    max_stream_size: usize,
}

impl Reaper {
    pub fn new(
        db: DbHandle,
        bus: Arc<dyn StreamBus>,
        storage: Arc<dyn ArtifactStorage>,
        retention_days: u64,
        max_stream_size: usize,
    ) -> Self {
        Self {
            db,
            bus,
            storage,
            retention_days,
            max_stream_size,
        }
    }

    /// Run the reconciler forever at the given interval.
    pub async fn run_periodic(&self, interval: Duration) {
        loop {
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Reconciler pass failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn run_once(&self) -> Result<(), RunnerError> {
        self.reap_stuck_tasks().await?;
        self.purge_deleted().await?;
        self.expire_streams().await?;
        self.trim_streams().await?;
        Ok(())
    }

    /// Tasks marked active but already carrying results lost their owner
    /// (a crashed worker); settle them into a terminal state.
    async fn reap_stuck_tasks(&self) -> Result<(), RunnerError> {
        let stuck = self.db.call(|db| db.stuck_tasks()).await?;
        for task in stuck {
            let has_error = task
                .results
                .as_ref()
                .map(|r| r.get("error").is_some())
                .unwrap_or(true);
            let archived = self
                .storage
                .exists(&task_archive_path(&task.client_id, &task.id))
                .await
                .unwrap_or(false);
            let status = if has_error || !archived {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            tracing::warn!(task = %task.id, status = %status, "Settling stuck task");
            let id = task.id.clone();
            self.db
                .call(move |db| db.finish_task(&id, status, None))
                .await?;
        }
        Ok(())
    }

    /// Hard-delete soft-deleted tasks older than the retention window,
    /// including their storage folders and streams.
    async fn purge_deleted(&self) -> Result<(), RunnerError> {
        let cutoff = self.cutoff();
        let rows = self
            .db
            .call(move |db| db.old_soft_deleted(&cutoff))
            .await?;
        if rows.is_empty() {
            return Ok(());
        }
        for (task_id, client_id) in &rows {
            if let Err(e) = self
                .storage
                .delete_folder(&task_folder(client_id, task_id))
                .await
            {
                tracing::warn!(task = %task_id, error = %e, "Failed to delete task storage");
            }
            for key in crate::bus::task_stream_keys(task_id) {
                let _ = self.bus.delete(&key).await;
            }
        }
        let ids: Vec<String> = rows.into_iter().map(|(id, _)| id).collect();
        let count = ids.len();
        self.db.call(move |db| db.hard_delete(&ids)).await?;
        tracing::info!(count, "Purged old deleted tasks");
        Ok(())
    }

    /// Drop streams of tasks whose retention window has passed.
    async fn expire_streams(&self) -> Result<(), RunnerError> {
        let cutoff = self.cutoff();
        let ids = self.db.call(move |db| db.tasks_ended_before(&cutoff)).await?;
        for task_id in ids {
            for key in crate::bus::task_stream_keys(&task_id) {
                let _ = self.bus.delete(&key).await;
            }
        }
        Ok(())
    }

    async fn trim_streams(&self) -> Result<(), RunnerError> {
        for key in self.bus.list_streams().await? {
            self.bus.trim(&key, self.max_stream_size).await?;
        }
        Ok(())
    }

    fn cutoff(&self) -> String {
        (chrono::Utc::now() - chrono::Duration::days(self.retention_days as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::{StatusPatch, TaskDb};
    use crate::envelope::Envelope;
    use crate::models::{Task, now_rfc3339};
    use crate::storage::LocalStorage;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            client_id: "c1".to_string(),
            flow_id: format!("f-{}", id),
            filename: "a.flow".to_string(),
            status: TaskStatus::Pending,
            status_version: 0,
            input_timeout: 180,
            max_duration: 0,
            input_request_id: None,
            results: None,
            soft_deleted: false,
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
        }
    }

    async fn setup() -> (Reaper, DbHandle, Arc<MemoryBus>, Arc<LocalStorage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let bus = Arc::new(MemoryBus::default());
        let storage = Arc::new(LocalStorage::new(dir.path().join("store")).unwrap());
        let reaper = Reaper::new(db.clone(), bus.clone(), storage.clone(), 30, 5);
        (reaper, db, bus, storage, dir)
    }

    #[tokio::test]
    async fn test_stuck_task_with_error_becomes_failed() {
        let (reaper, db, _bus, _storage, _dir) = setup().await;
        db.call(|db| {
            db.create_task(&sample_task("t1"), None)?;
            db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())?;
            db.merge_results("t1", "error", serde_json::json!("worker crashed"))
        })
        .await
        .unwrap();

        reaper.run_once().await.unwrap();
        let task = db.call(|db| db.get_task("t1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_stuck_task_with_archive_becomes_completed() {
        let (reaper, db, _bus, storage, _dir) = setup().await;
        db.call(|db| {
            db.create_task(&sample_task("t1"), None)?;
            db.update_task_status("t1", TaskStatus::Pending, TaskStatus::Running, StatusPatch::default())?;
            db.merge_results("t1", "summary", serde_json::json!("done"))
        })
        .await
        .unwrap();
        storage
            .put(&task_archive_path("c1", "t1"), b"tar".to_vec())
            .await
            .unwrap();

        reaper.run_once().await.unwrap();
        let task = db.call(|db| db.get_task("t1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_purge_old_soft_deleted() {
        let (reaper, db, bus, storage, _dir) = setup().await;
        let mut old = sample_task("old");
        old.created_at = "2020-01-01T00:00:00.000Z".into();
        db.call(move |db| {
            db.create_task(&old, None)?;
            db.soft_delete("old")?;
            Ok(())
        })
        .await
        .unwrap();
        storage.put("c1/old/a.flow", b"x".to_vec()).await.unwrap();
        bus.xadd(&crate::bus::task_output_stream("old"), &Envelope::print("old", "x"))
            .await
            .unwrap();

        reaper.run_once().await.unwrap();
        assert!(db.call(|db| db.get_task("old")).await.unwrap().is_none());
        assert!(!storage.exists("c1/old/a.flow").await.unwrap());
        assert!(
            bus.xrange(&crate::bus::task_output_stream("old"), 0)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_recent_soft_deleted_not_purged() {
        let (reaper, db, _bus, _storage, _dir) = setup().await;
        db.call(|db| {
            db.create_task(&sample_task("fresh"), None)?;
            db.soft_delete("fresh")?;
            Ok(())
        })
        .await
        .unwrap();

        reaper.run_once().await.unwrap();
        assert!(db.call(|db| db.get_task("fresh")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_trim_streams() {
        let (reaper, _db, bus, _storage, _dir) = setup().await;
        for i in 0..20 {
            bus.xadd("task:x:output", &Envelope::print("x", i)).await.unwrap();
        }
        reaper.run_once().await.unwrap();
        assert_eq!(bus.xrange("task:x:output", 0).await.unwrap().len(), 5);
    }
}
