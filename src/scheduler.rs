//! Submission admission and the worker pool.
//!
//! `submit` enforces admission (per-client quota, permission oracle,
//! duplicate-flow refusal, payload validation) before a task record is
//! created; admitted tasks queue in the persistence layer and are claimed
//! FIFO by `max_jobs` workers. Each worker owns one task end-to-end: it is
//! the single writer of that task's status for the duration of the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};

use crate::auth::{PermissionDecision, PermissionOracle};
use crate::bus::{StreamBus, status_channel};
use crate::collector::ResultCollector;
use crate::config::Settings;
use crate::db::DbHandle;
use crate::envelope::Envelope;
use crate::errors::RunnerError;
use crate::mediator::IoMediator;
use crate::models::{Task, TaskStatus, now_rfc3339};
use crate::storage::{ArtifactStorage, flow_fingerprint, task_file_path};
use crate::supervisor::{ProcessSupervisor, interpret_exit, terminate_group};

/// Flow artifact extensions accepted at the boundary.
const ALLOWED_EXTENSIONS: &[&str] = &[".flow", ".json"];

/// How long an idle worker sleeps between claim attempts when no
/// submission nudge arrives.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone)]
pub struct SubmitOptions {
    pub input_timeout: Option<u64>,
    pub max_duration: Option<u64>,
    pub env_vars: HashMap<String, String>,
}

pub struct TaskScheduler {
    settings: Settings,
    db: DbHandle,
    bus: Arc<dyn StreamBus>,
    storage: Arc<dyn ArtifactStorage>,
    mediator: Arc<IoMediator>,
    supervisor: ProcessSupervisor,
    collector: ResultCollector,
    oracle: Arc<dyn PermissionOracle>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    /// Pid of the process group per running task, for shutdown teardown.
    running: Mutex<HashMap<String, i32>>,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        db: DbHandle,
        bus: Arc<dyn StreamBus>,
        storage: Arc<dyn ArtifactStorage>,
        mediator: Arc<IoMediator>,
        oracle: Arc<dyn PermissionOracle>,
    ) -> Arc<Self> {
        let supervisor = ProcessSupervisor::new(
            settings.agent_cmd.clone(),
            Duration::from_secs(settings.cancel_grace_secs),
        );
        let collector = ResultCollector::new(
            db.clone(),
            bus.clone(),
            storage.clone(),
            Duration::from_millis(settings.drain_window_ms),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            db,
            bus,
            storage,
            mediator,
            supervisor,
            collector,
            oracle,
            notify: Notify::new(),
            shutdown_tx,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    /// Admit and record a submission. The returned task is PENDING; a
    /// worker picks it up in FIFO order.
    pub async fn submit(
        &self,
        client_id: &str,
        filename: &str,
        content: Vec<u8>,
        options: SubmitOptions,
    ) -> Result<Task, RunnerError> {
        validate_filename(filename)?;
        if content.is_empty() {
            return Err(RunnerError::ValidationFailed("Empty flow file".into()));
        }

        match self.oracle.may_run(client_id).await? {
            PermissionDecision::Allow => {}
            PermissionDecision::Deny { reason } => {
                return Err(RunnerError::PermissionDenied { reason });
            }
        }

        let limit = self.settings.client_task_limit;
        let owner = client_id.to_string();
        let active = self
            .db
            .call(move |db| db.count_active_tasks(&owner))
            .await?;
        if active >= limit as i64 {
            return Err(RunnerError::QuotaExceeded { limit });
        }

        let flow_id = flow_fingerprint(&content, filename);
        let owner = client_id.to_string();
        let flow = flow_id.clone();
        if let Some(existing) = self
            .db
            .call(move |db| db.find_active_flow_task(&owner, &flow))
            .await?
        {
            return Err(RunnerError::ValidationFailed(format!(
                "A task with the same file already exists. Task ID: {}, status: {}",
                existing.id, existing.status
            )));
        }

        let task = Task {
            id: uuid::Uuid::new_v4().simple().to_string(),
            client_id: client_id.to_string(),
            flow_id,
            filename: filename.to_string(),
            status: TaskStatus::Pending,
            status_version: 0,
            input_timeout: options.input_timeout.unwrap_or(self.settings.input_timeout),
            max_duration: options.max_duration.unwrap_or(self.settings.max_task_duration),
            input_request_id: None,
            results: None,
            soft_deleted: false,
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
        };
        self.storage
            .put(
                &task_file_path(&task.client_id, &task.id, &task.filename),
                content,
            )
            .await?;

        let record = task.clone();
        let env_vars = options.env_vars;
        let created = self
            .db
            .call(move |db| db.create_task(&record, Some(&env_vars)))
            .await?;

        let depth = self.db.call(|db| db.count_pending()).await.unwrap_or(0);
        tracing::info!(task = %created.id, client = %client_id, queue_depth = depth, "Task submitted");
        self.notify.notify_one();
        Ok(created)
    }

    /// Start the worker set. Each worker claims and runs one task at a
    /// time until shutdown.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|idx| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.worker_loop(idx).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "Worker started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let claimed = match self.db.call(|db| db.claim_next_pending()).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(worker, error = %e, "Claim failed");
                    None
                }
            };
            match claimed {
                Some(task) => {
                    tracing::info!(worker, task = %task.id, "Task claimed");
                    self.run_claimed(task).await;
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Worker stopped");
    }

    /// Run a claimed (already RUNNING) task end-to-end.
    async fn run_claimed(self: &Arc<Self>, task: Task) {
        self.publish_status(&task.id, TaskStatus::Running).await;

        // Subscribe before launch so no cancellation broadcast is missed.
        let watcher = match self.bus.subscribe(&status_channel(&task.id)).await {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "Status watch unavailable");
                None
            }
        };

        let env_vars = self
            .db
            .call({
                let id = task.id.clone();
                move |db| db.get_env_vars(&id)
            })
            .await
            .unwrap_or_default();

        let (workdir, flow_path) = match self
            .supervisor
            .provision_workdir(self.storage.as_ref(), &task)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                self.fail_before_launch(&task, &format!("Failed to prepare environment: {}", e))
                    .await;
                return;
            }
        };

        let socket_path = match self.mediator.register(&task).await {
            Ok(path) => path,
            Err(e) => {
                self.fail_before_launch(&task, &format!("Failed to bind task I/O: {}", e))
                    .await;
                return;
            }
        };

        let mut process = match self
            .supervisor
            .launch(&task, workdir.path(), &flow_path, &socket_path, &env_vars)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.mediator.unregister(&task.id).await;
                self.fail_before_launch(&task, &format!("Failed to start task: {}", e))
                    .await;
                return;
            }
        };

        if let Some(pid) = process.pid() {
            self.running.lock().await.insert(task.id.clone(), pid);
        }

        // Watchdog: terminates the process group when a terminal status is
        // broadcast (cancellation, protocol failure) or the max duration
        // elapses. The worker itself only waits on the child.
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = watcher.map(|mut watcher| {
            let grace = self.supervisor.cancel_grace();
            let max_duration = task.max_duration;
            let pid = process.pid();
            let timed_out = Arc::clone(&timed_out);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let deadline = tokio::time::sleep(Duration::from_secs(max_duration.max(1)));
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        maybe = watcher.next() => match maybe {
                            Some(envelope) if is_terminating_status(&envelope) => {
                                tracing::info!(task = %task_id, "Terminal status observed, stopping child");
                                if let Some(pid) = pid {
                                    terminate_group(pid, grace).await;
                                }
                                return;
                            }
                            Some(_) => {}
                            None => return,
                        },
                        _ = &mut deadline, if max_duration > 0 => {
                            tracing::warn!(task = %task_id, max_duration, "Task exceeded max duration");
                            timed_out.store(true, Ordering::SeqCst);
                            if let Some(pid) = pid {
                                terminate_group(pid, grace).await;
                            }
                            return;
                        }
                    }
                }
            })
        });

        // Cancellation may have landed between the claim and the watch
        // subscription; catch up from the record.
        let current = self
            .db
            .call({
                let id = task.id.clone();
                move |db| db.get_task(&id)
            })
            .await
            .ok()
            .flatten();
        if let Some(current) = &current
            && current.status.is_terminal()
            && let Some(pid) = process.pid()
        {
            terminate_group(pid, self.supervisor.cancel_grace()).await;
        }

        let exit_status = process.wait().await;
        if let Some(handle) = watchdog {
            handle.abort();
        }
        let stderr = process.stderr_output().await;

        let (final_status, mut results) = if timed_out.load(Ordering::SeqCst) {
            (
                TaskStatus::Failed,
                serde_json::json!({
                    "error": "Task duration exceeded its limit.",
                    "reason": "timeout",
                }),
            )
        } else {
            match exit_status {
                Ok(status) => interpret_exit(status),
                Err(e) => (
                    TaskStatus::Failed,
                    serde_json::json!({ "error": format!("Failed to reap task process: {}", e) }),
                ),
            }
        };
        if final_status == TaskStatus::Failed && !stderr.is_empty() {
            results["diagnostic"] = serde_json::Value::String(stderr);
        }

        let finish = self
            .db
            .call({
                let id = task.id.clone();
                let results = if results.is_null() { None } else { Some(results) };
                move |db| db.finish_task(&id, final_status, results)
            })
            .await;
        match finish {
            Ok(Some(_)) => self.publish_status(&task.id, final_status).await,
            // Someone else (cancel controller, mediator) already owned the
            // terminal transition and published it.
            Ok(None) => {}
            Err(e) => tracing::error!(task = %task.id, error = %e, "Failed to record exit"),
        }

        let recorded_status = self
            .db
            .call({
                let id = task.id.clone();
                move |db| db.get_task(&id)
            })
            .await
            .ok()
            .flatten()
            .map(|t| t.status)
            .unwrap_or(final_status);

        self.collector
            .finalize(&task.id, &task.client_id, recorded_status, Some(workdir.path()))
            .await;
        self.mediator.unregister(&task.id).await;
        self.running.lock().await.remove(&task.id);
        tracing::info!(task = %task.id, status = %recorded_status, "Task finished");
    }

    async fn fail_before_launch(&self, task: &Task, detail: &str) {
        tracing::error!(task = %task.id, detail, "Task failed before launch");
        let results = serde_json::json!({ "error": detail, "reason": "infrastructure" });
        let _ = self
            .db
            .call({
                let id = task.id.clone();
                move |db| db.finish_task(&id, TaskStatus::Failed, Some(results))
            })
            .await;
        self.publish_status(&task.id, TaskStatus::Failed).await;
        self.collector
            .finalize(&task.id, &task.client_id, TaskStatus::Failed, None)
            .await;
        self.mediator.unregister(&task.id).await;
    }

    async fn publish_status(&self, task_id: &str, status: TaskStatus) {
        let envelope = Envelope::status(task_id, status, serde_json::Value::Null);
        if let Err(e) = self.bus.publish(&status_channel(task_id), &envelope).await {
            tracing::warn!(task = %task_id, error = %e, "Failed to publish status");
        }
    }

    /// Stop claiming work and tear down all running process groups.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();
        let running: Vec<(String, i32)> = self.running.lock().await.drain().collect();
        for (task_id, pid) in running {
            tracing::info!(task = %task_id, pid, "Stopping task on shutdown");
            terminate_group(pid, self.supervisor.cancel_grace()).await;
        }
    }
}

fn validate_filename(filename: &str) -> Result<(), RunnerError> {
    if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
        return Err(RunnerError::ValidationFailed("Invalid file".into()));
    }
    if !ALLOWED_EXTENSIONS.iter().any(|ext| filename.ends_with(ext)) {
        return Err(RunnerError::ValidationFailed("Invalid file type".into()));
    }
    Ok(())
}

fn is_terminating_status(envelope: &Envelope) -> bool {
    matches!(envelope, Envelope::Status { data, .. }
        if matches!(data["status"].as_str(), Some("CANCELLED") | Some("FAILED")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::bus::MemoryBus;
    use crate::control::CancelController;
    use crate::db::TaskDb;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    struct DenyAll;

    #[async_trait]
    impl PermissionOracle for DenyAll {
        async fn may_run(&self, _user_id: &str) -> Result<PermissionDecision, RunnerError> {
            Ok(PermissionDecision::Deny {
                reason: "not on the plan".into(),
            })
        }
    }

    struct Harness {
        scheduler: Arc<TaskScheduler>,
        db: DbHandle,
        bus: Arc<MemoryBus>,
        storage: Arc<LocalStorage>,
        _dir: tempfile::TempDir,
    }

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn harness_with(settings_mut: impl FnOnce(&mut Settings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            storage_root: dir.path().join("store"),
            socket_dir: dir.path().join("sock"),
            agent_cmd: write_script(dir.path(), "exit 0"),
            cancel_grace_secs: 1,
            drain_window_ms: 10,
            ..Settings::default()
        };
        settings_mut(&mut settings);

        let db = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let bus = Arc::new(MemoryBus::default());
        let storage = Arc::new(LocalStorage::new(&settings.storage_root).unwrap());
        let mediator = IoMediator::new(db.clone(), bus.clone(), settings.socket_dir.clone());
        let scheduler = TaskScheduler::new(
            settings,
            db.clone(),
            bus.clone(),
            storage.clone(),
            mediator,
            Arc::new(AllowAll),
        );
        Harness {
            scheduler,
            db,
            bus,
            storage,
            _dir: dir,
        }
    }

    async fn wait_for_terminal(db: &DbHandle, id: &str) -> Task {
        for _ in 0..300 {
            let id_owned = id.to_string();
            let task = db
                .call(move |db| db.get_task(&id_owned))
                .await
                .unwrap()
                .unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submit_creates_pending_task_and_stores_file() {
        let h = harness_with(|_| {});
        let task = h
            .scheduler
            .submit("c1", "hello.flow", b"flow body".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.input_timeout, 180);
        assert!(
            h.storage
                .exists(&task_file_path("c1", &task.id, "hello.flow"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_filenames() {
        let h = harness_with(|_| {});
        for bad in ["run.exe", "noext", "../escape.flow", "a/b.flow", ""] {
            let err = h
                .scheduler
                .submit("c1", bad, b"x".to_vec(), SubmitOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::ValidationFailed(_)), "{}", bad);
        }
        let err = h
            .scheduler
            .submit("c1", "empty.flow", Vec::new(), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_submit_quota_exceeded() {
        let h = harness_with(|s| s.client_task_limit = 2);
        for i in 0..2 {
            h.scheduler
                .submit("c1", &format!("f{}.flow", i), b"x".to_vec(), SubmitOptions::default())
                .await
                .unwrap();
        }
        let err = h
            .scheduler
            .submit("c1", "f3.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::QuotaExceeded { limit: 2 }));
        // No task record was created for the rejected submission.
        let page = h.db.call(|db| db.list_tasks("c1", 1, 50)).await.unwrap();
        assert_eq!(page.total, 2);
        // A different client is unaffected.
        h.scheduler
            .submit("c2", "f1.flow", b"y".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_duplicate_active_flow_rejected() {
        let h = harness_with(|_| {});
        h.scheduler
            .submit("c1", "same.flow", b"identical".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
        let err = h
            .scheduler
            .submit("c1", "same.flow", b"identical".to_vec(), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ValidationFailed(_)));
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_submit_denied_by_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            storage_root: dir.path().join("store"),
            socket_dir: dir.path().join("sock"),
            ..Settings::default()
        };
        let db = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let bus = Arc::new(MemoryBus::default());
        let storage = Arc::new(LocalStorage::new(&settings.storage_root).unwrap());
        let mediator = IoMediator::new(db.clone(), bus.clone(), settings.socket_dir.clone());
        let scheduler = TaskScheduler::new(
            settings,
            db,
            bus,
            storage,
            mediator,
            Arc::new(DenyAll),
        );

        let err = scheduler
            .submit("c1", "a.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap_err();
        match err {
            RunnerError::PermissionDenied { reason } => assert_eq!(reason, "not on the plan"),
            other => panic!("Expected PermissionDenied, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_runs_task_to_completion() {
        let h = harness_with(|_| {});
        h.scheduler.spawn_workers(1);

        let task = h
            .scheduler
            .submit("c1", "ok.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
        let finished = wait_for_terminal(&h.db, &task.id).await;
        assert_eq!(finished.status, TaskStatus::Completed);
        assert!(finished.started_at.is_some());
        assert!(finished.ended_at.is_some());

        // The collector lands the archive and closing termination envelope
        // shortly after the terminal transition.
        for _ in 0..100 {
            let archived = h
                .storage
                .exists(&crate::storage::task_archive_path("c1", &task.id))
                .await
                .unwrap();
            let terminated = h
                .bus
                .xrange(&crate::bus::task_output_stream(&task.id), 0)
                .await
                .unwrap()
                .iter()
                .any(|(_, e)| e.kind() == "termination");
            if archived && terminated {
                h.scheduler.shutdown().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("collector never finalized the task");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_records_failure_with_diagnostic() {
        let h = harness_with(|s| {
            s.agent_cmd = write_script(s.storage_root.parent().unwrap(), "echo oops >&2\nexit 7");
        });
        h.scheduler.spawn_workers(1);

        let task = h
            .scheduler
            .submit("c1", "bad.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
        let finished = wait_for_terminal(&h.db, &task.id).await;
        assert_eq!(finished.status, TaskStatus::Failed);
        let results = finished.results.unwrap();
        assert!(results["error"].as_str().unwrap().contains("exit code 7"));
        assert!(results["diagnostic"].as_str().unwrap().contains("oops"));
        h.scheduler.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_running_task_terminates_child() {
        let h = harness_with(|s| {
            s.agent_cmd = write_script(s.storage_root.parent().unwrap(), "sleep 60");
        });
        h.scheduler.spawn_workers(1);
        let controller = CancelController::new(h.db.clone(), h.bus.clone());

        let task = h
            .scheduler
            .submit("c1", "long.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap();

        // Wait until the worker picked it up.
        for _ in 0..100 {
            let id = task.id.clone();
            let current = h.db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
            if current.status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let cancelled = controller.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let finished = wait_for_terminal(&h.db, &task.id).await;
        assert_eq!(finished.status, TaskStatus::Cancelled);
        // Idempotent: cancelling again returns the same record.
        let again = controller.cancel(&task.id).await.unwrap();
        assert_eq!(again.status_version, finished.status_version);
        h.scheduler.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_max_duration_fails_with_timeout_reason() {
        let h = harness_with(|s| {
            s.agent_cmd = write_script(s.storage_root.parent().unwrap(), "sleep 60");
        });
        h.scheduler.spawn_workers(1);

        let task = h
            .scheduler
            .submit(
                "c1",
                "slow.flow",
                b"x".to_vec(),
                SubmitOptions {
                    max_duration: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let finished = wait_for_terminal(&h.db, &task.id).await;
        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(finished.results.unwrap()["reason"], "timeout");
        h.scheduler.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_before_dispatch_never_runs() {
        let h = harness_with(|_| {});
        let controller = CancelController::new(h.db.clone(), h.bus.clone());

        // No workers yet: the task stays PENDING.
        let task = h
            .scheduler
            .submit("c1", "queued.flow", b"x".to_vec(), SubmitOptions::default())
            .await
            .unwrap();
        controller.cancel(&task.id).await.unwrap();

        h.scheduler.spawn_workers(1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let id = task.id.clone();
        let current = h.db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Cancelled);
        // started_at was never stamped: the task never dispatched.
        assert!(current.started_at.is_none());
        h.scheduler.shutdown().await;
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("a.flow").is_ok());
        assert!(validate_filename("b.json").is_ok());
        assert!(validate_filename("a.yaml").is_err());
        assert!(validate_filename("a/b.flow").is_err());
    }

    #[test]
    fn test_is_terminating_status() {
        let cancelled = Envelope::status("t1", TaskStatus::Cancelled, serde_json::Value::Null);
        let failed = Envelope::status("t1", TaskStatus::Failed, serde_json::Value::Null);
        let running = Envelope::status("t1", TaskStatus::Running, serde_json::Value::Null);
        assert!(is_terminating_status(&cancelled));
        assert!(is_terminating_status(&failed));
        assert!(!is_terminating_status(&running));
        assert!(!is_terminating_status(&Envelope::print("t1", "x")));
    }
}
