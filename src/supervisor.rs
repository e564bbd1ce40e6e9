//! Child process lifecycle: isolated working directories, spawning in a
//! dedicated process group, signal escalation, and exit interpretation.
//!
//! The supervisor never parses child stdout/stderr for domain I/O — that
//! travels over the stream bus through the mediator's per-task socket.
//! Stderr is captured only as an opaque failure diagnostic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::errors::RunnerError;
use crate::models::{Task, TaskStatus};
use crate::storage::{ArtifactStorage, task_file_path};

/// Cap on captured stderr; enough for a crash trace, not a log firehose.
const STDERR_CAP: usize = 64 * 1024;

/// Env vars identifying the task and the bus ingress to the child.
pub const ENV_TASK_ID: &str = "FLOW_TASK_ID";
pub const ENV_BUS_SOCKET: &str = "FLOW_BUS_SOCKET";

pub struct ProcessSupervisor {
    agent_cmd: String,
    cancel_grace: Duration,
}

/// A launched child. Signals go to the whole process group so descendants
/// are reaped with the parent.
pub struct TaskProcess {
    child: Child,
    pid: Option<i32>,
    stderr_task: Option<tokio::task::JoinHandle<String>>,
}

impl ProcessSupervisor {
    pub fn new(agent_cmd: String, cancel_grace: Duration) -> Self {
        Self {
            agent_cmd,
            cancel_grace,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    /// Allocate a fresh working directory and materialize the flow file.
    pub async fn provision_workdir(
        &self,
        storage: &dyn ArtifactStorage,
        task: &Task,
    ) -> Result<(TempDir, PathBuf), RunnerError> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("flow-task-{}-", task.id))
            .tempdir()
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Failed to create workdir: {}", e)))?;
        let flow_path = workdir.path().join(&task.filename);
        storage
            .copy_to(
                &task_file_path(&task.client_id, &task.id, &task.filename),
                &flow_path,
            )
            .await?;
        Ok((workdir, flow_path))
    }

    /// Spawn the agent command for a task in its own process group.
    pub async fn launch(
        &self,
        task: &Task,
        workdir: &Path,
        flow_path: &Path,
        socket_path: &Path,
        env_vars: &HashMap<String, String>,
    ) -> Result<TaskProcess, RunnerError> {
        write_dot_env(workdir, env_vars)
            .await
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Failed to write .env: {}", e)))?;

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.arg("--task-id")
            .arg(&task.id)
            .arg("--socket")
            .arg(socket_path)
            .arg(flow_path)
            .current_dir(workdir)
            .env(ENV_TASK_ID, &task.id)
            .env(ENV_BUS_SOCKET, socket_path)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(error = %e, cmd = %self.agent_cmd, "Failed to spawn agent process");
            RunnerError::Internal(anyhow::anyhow!("Failed to spawn agent process: {}", e))
        })?;
        let pid = child.id().map(|p| p as i32);
        tracing::info!(task = %task.id, pid = ?pid, "Spawned agent process");

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(1024);
                let mut chunk = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    if buf.len() < STDERR_CAP {
                        let take = n.min(STDERR_CAP - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                    }
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(TaskProcess {
            child,
            pid,
            stderr_task,
        })
    }
}

impl TaskProcess {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Deliver SIGTERM to the process group; escalate to SIGKILL after the
    /// grace window.
    pub async fn terminate(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        tracing::info!(pid = ?self.pid, "Terminating process group");
        self.signal(TermSignal::Term);
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            tracing::warn!(pid = ?self.pid, "Grace window elapsed, killing");
            self.signal(TermSignal::Kill);
            let _ = self.child.wait().await;
        }
    }

    fn signal(&mut self, sig: TermSignal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            let signal = match sig {
                TermSignal::Term => Signal::SIGTERM,
                TermSignal::Kill => Signal::SIGKILL,
            };
            if killpg(Pid::from_raw(pid), signal).is_ok() {
                return;
            }
        }
        let _ = self.child.start_kill();
        let _ = sig;
    }

    /// Captured stderr, available once the child has exited.
    pub async fn stderr_output(&mut self) -> String {
        match self.stderr_task.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Term,
    Kill,
}

/// Signal a process group directly by pid: TERM, then KILL after the grace
/// window. Used by watchdogs that observe cancellation without owning the
/// child handle; signalling an already-reaped group is harmless.
pub async fn terminate_group(pid: i32, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let pgid = Pid::from_raw(pid);
        let _ = killpg(pgid, Signal::SIGTERM);
        tokio::time::sleep(grace).await;
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}

/// Map a child exit status to the terminal task state.
///
/// 0 → COMPLETED; terminated by signal (our cancel path) → CANCELLED;
/// any other non-zero exit → FAILED. Max-duration timeouts never reach
/// here — the worker fails the task before interpreting an exit.
pub fn interpret_exit(status: std::process::ExitStatus) -> (TaskStatus, serde_json::Value) {
    if status.success() {
        return (TaskStatus::Completed, serde_json::Value::Null);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            let detail = if sig == libc_sigterm() {
                "Task was terminated by signal".to_string()
            } else {
                format!("Terminated by signal {}", sig)
            };
            return (TaskStatus::Cancelled, serde_json::json!({ "error": detail }));
        }
    }
    let code = status.code().unwrap_or(-1);
    (
        TaskStatus::Failed,
        serde_json::json!({ "error": format!("Task failed with exit code {}", code) }),
    )
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    nix::sys::signal::Signal::SIGTERM as i32
}

/// Write task env vars to a `.env` file in the working directory, where
/// flow interpreters expect them.
pub async fn write_dot_env(
    workdir: &Path,
    env_vars: &HashMap<String, String>,
) -> std::io::Result<()> {
    let mut content = String::new();
    for (key, value) in env_vars {
        content.push_str(&format!("{}={}\n", key, value));
    }
    tokio::fs::write(workdir.join(".env"), content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_rfc3339;
    use crate::storage::LocalStorage;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            client_id: "c1".to_string(),
            flow_id: "f1".to_string(),
            filename: "job.flow".to_string(),
            status: TaskStatus::Running,
            status_version: 1,
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

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_exit() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        let (status, results) = interpret_exit(ExitStatus::from_raw(0));
        assert_eq!(status, TaskStatus::Completed);
        assert!(results.is_null());

        // Exit codes are encoded in the high byte of a wait status.
        let (status, results) = interpret_exit(ExitStatus::from_raw(1 << 8));
        assert_eq!(status, TaskStatus::Failed);
        assert!(results["error"].as_str().unwrap().contains("exit code 1"));

        // Killed by SIGTERM: our cancellation path.
        let (status, _) = interpret_exit(ExitStatus::from_raw(15));
        assert_eq!(status, TaskStatus::Cancelled);

        // Any other signal still reads as a termination.
        let (status, results) = interpret_exit(ExitStatus::from_raw(9));
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(results["error"].as_str().unwrap().contains("signal 9"));
    }

    #[tokio::test]
    async fn test_write_dot_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "abc123".to_string());
        write_dot_env(dir.path(), &env).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(content, "API_KEY=abc123\n");
    }

    #[tokio::test]
    async fn test_provision_workdir_materializes_flow() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path().join("store")).unwrap();
        let task = sample_task("t1");
        storage
            .put(&task_file_path("c1", "t1", "job.flow"), b"flow body".to_vec())
            .await
            .unwrap();

        let supervisor = ProcessSupervisor::new("true".to_string(), Duration::from_secs(1));
        let (workdir, flow_path) = supervisor.provision_workdir(&storage, &task).await.unwrap();
        assert!(flow_path.starts_with(workdir.path()));
        assert_eq!(std::fs::read(&flow_path).unwrap(), b"flow body");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_wait_success() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");
        let supervisor =
            ProcessSupervisor::new(script.to_string_lossy().into_owned(), Duration::from_secs(1));

        let task = sample_task("t1");
        let workdir = tempfile::tempdir().unwrap();
        let flow = workdir.path().join("job.flow");
        std::fs::write(&flow, "x").unwrap();
        let socket = dir.path().join("t1.sock");

        let mut process = supervisor
            .launch(&task, workdir.path(), &flow, &socket, &HashMap::new())
            .await
            .unwrap();
        assert!(process.pid().is_some());
        let status = process.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo boom >&2\nexit 3");
        let supervisor =
            ProcessSupervisor::new(script.to_string_lossy().into_owned(), Duration::from_secs(1));

        let task = sample_task("t1");
        let workdir = tempfile::tempdir().unwrap();
        let flow = workdir.path().join("job.flow");
        std::fs::write(&flow, "x").unwrap();

        let mut process = supervisor
            .launch(&task, workdir.path(), &flow, &dir.path().join("s.sock"), &HashMap::new())
            .await
            .unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        let stderr = process.stderr_output().await;
        assert!(stderr.contains("boom"));
        let (final_status, _) = interpret_exit(status);
        assert_eq!(final_status, TaskStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 60");
        let supervisor =
            ProcessSupervisor::new(script.to_string_lossy().into_owned(), Duration::from_secs(2));

        let task = sample_task("t1");
        let workdir = tempfile::tempdir().unwrap();
        let flow = workdir.path().join("job.flow");
        std::fs::write(&flow, "x").unwrap();

        let mut process = supervisor
            .launch(&task, workdir.path(), &flow, &dir.path().join("s.sock"), &HashMap::new())
            .await
            .unwrap();
        // Give the shell a moment to exec sleep.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        process.terminate(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(5));

        let status = process.wait().await.unwrap();
        let (final_status, _) = interpret_exit(status);
        assert_eq!(final_status, TaskStatus::Cancelled);
    }
}
