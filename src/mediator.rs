//! The I/O mediator: routes output and interactive input between the child
//! process and remote consumers, correlating prompts and responses by
//! request id.
//!
//! Each task gets a Unix socket under the socket directory; the child
//! connects and speaks newline-delimited JSON envelopes. Sink side, the
//! mediator fans child output onto the per-task and shared streams and
//! turns `input_request` into a WAITING_FOR_INPUT flip plus a pub/sub
//! notification. Source side, responses arriving over HTTP or WebSocket are
//! validated against the single outstanding prompt and written back to the
//! child. When the prompt's deadline fires first, a lone newline is
//! synthesized in place of the missing response.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::bus::{
    self, COMMON_OUTPUT_STREAM, StreamBus, input_request_channel, input_response_channel,
    status_channel, task_output_stream,
};
use crate::db::{DbHandle, StatusPatch};
use crate::envelope::Envelope;
use crate::errors::RunnerError;
use crate::models::{Task, TaskStatus};

/// The synthesized response when an input deadline fires.
const DEFAULT_INPUT: &str = "\n";

struct PendingInput {
    request_id: String,
    deadline: Instant,
}

struct TaskIo {
    input_timeout: Duration,
    pending: Option<PendingInput>,
    child_tx: Option<mpsc::UnboundedSender<String>>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct IoMediator {
    db: DbHandle,
    bus: Arc<dyn StreamBus>,
    socket_dir: PathBuf,
    tasks: Mutex<HashMap<String, TaskIo>>,
}

impl IoMediator {
    pub fn new(db: DbHandle, bus: Arc<dyn StreamBus>, socket_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            socket_dir,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the task's I/O socket and start accepting the child connection.
    /// Returns the socket path to hand to the supervisor.
    pub async fn register(self: &Arc<Self>, task: &Task) -> Result<PathBuf, RunnerError> {
        tokio::fs::create_dir_all(&self.socket_dir)
            .await
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Socket dir: {}", e)))?;
        let socket_path = self.socket_dir.join(format!("{}.sock", task.id));
        let _ = tokio::fs::remove_file(&socket_path).await;
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Failed to bind socket: {}", e)))?;
        tracing::debug!(task = %task.id, socket = %socket_path.display(), "Bound task socket");

        // The entry must exist before the first connection can be accepted.
        self.tasks.lock().await.insert(
            task.id.clone(),
            TaskIo {
                input_timeout: Duration::from_secs(task.input_timeout),
                pending: None,
                child_tx: None,
                accept_task: None,
            },
        );

        let mediator = Arc::clone(self);
        let task_id = task.id.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        tracing::debug!(task = %task_id, "Child connected");
                        mediator.handle_child_connection(&task_id, stream).await;
                    }
                    Err(e) => {
                        tracing::error!(task = %task_id, error = %e, "Socket accept failed");
                        break;
                    }
                }
            }
        });

        if let Some(io) = self.tasks.lock().await.get_mut(&task.id) {
            io.accept_task = Some(accept_task);
        } else {
            accept_task.abort();
        }
        Ok(socket_path)
    }

    /// Tear down the task's transient I/O state; pending prompts are
    /// discarded.
    pub async fn unregister(&self, task_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(io) = tasks.remove(task_id)
            && let Some(handle) = io.accept_task
        {
            handle.abort();
        }
        drop(tasks);
        let _ = tokio::fs::remove_file(self.socket_dir.join(format!("{}.sock", task_id))).await;
    }

    async fn handle_child_connection(self: &Arc<Self>, task_id: &str, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(task_id) {
                Some(io) => io.child_tx = Some(tx),
                None => return,
            }
        }
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => self.on_child_envelope(task_id, envelope).await,
                        Err(e) => {
                            self.fatal_protocol(task_id, &format!("malformed envelope: {}", e))
                                .await;
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "Child socket read failed");
                    break;
                }
            }
        }

        writer.abort();
        let mut tasks = self.tasks.lock().await;
        if let Some(io) = tasks.get_mut(task_id) {
            io.child_tx = None;
        }
    }

    async fn on_child_envelope(self: &Arc<Self>, task_id: &str, envelope: Envelope) {
        let envelope = envelope.with_task_id(task_id);
        match &envelope {
            Envelope::Print { .. } | Envelope::Termination { .. } | Envelope::Status { .. } => {
                self.append_output(task_id, &envelope).await;
            }
            Envelope::InputRequest {
                data,
                request_id,
                password,
                ..
            } => {
                self.handle_input_request(
                    task_id,
                    data.clone(),
                    request_id.clone(),
                    password.unwrap_or(false),
                )
                .await;
            }
            Envelope::InputResponse { .. } => {
                // Responses originate from consumers, never from the child.
                tracing::warn!(task = %task_id, "Ignoring input_response from child");
            }
        }
    }

    async fn handle_input_request(
        self: &Arc<Self>,
        task_id: &str,
        prompt: serde_json::Value,
        request_id: Option<String>,
        password: bool,
    ) {
        let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let deadline = {
            let mut tasks = self.tasks.lock().await;
            let Some(io) = tasks.get_mut(task_id) else {
                return;
            };
            if io.pending.is_some() {
                drop(tasks);
                self.fatal_protocol(
                    task_id,
                    "input_request while a prompt is already outstanding",
                )
                .await;
                return;
            }
            let deadline = Instant::now() + io.input_timeout;
            io.pending = Some(PendingInput {
                request_id: request_id.clone(),
                deadline,
            });
            deadline
        };

        let flip = self
            .db
            .call({
                let task_id = task_id.to_string();
                let request_id = request_id.clone();
                move |db| {
                    db.update_task_status(
                        &task_id,
                        TaskStatus::Running,
                        TaskStatus::WaitingForInput,
                        StatusPatch {
                            input_request_id: Some(Some(request_id)),
                            ..Default::default()
                        },
                    )
                }
            })
            .await;
        if let Err(e) = flip {
            // The task left RUNNING under us (cancellation in flight); the
            // prompt is moot.
            tracing::debug!(task = %task_id, error = %e, "Prompt dropped, task not running");
            let mut tasks = self.tasks.lock().await;
            if let Some(io) = tasks.get_mut(task_id) {
                io.pending = None;
            }
            return;
        }

        let prompt_str = match &prompt {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let envelope = Envelope::input_request(task_id, &request_id, prompt_str, password);
        self.publish_with_retry(&input_request_channel(task_id), &envelope)
            .await;
        self.append_output(task_id, &envelope).await;
        self.publish_status(task_id, TaskStatus::WaitingForInput, serde_json::Value::Null)
            .await;

        let mediator = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            mediator.on_input_deadline(&task_id, &request_id).await;
        });
    }

    /// Accept an input response from either the WebSocket gateway or the
    /// input endpoint. First acceptance wins; later attempts see NotWaiting.
    pub async fn submit_input(
        &self,
        task_id: &str,
        request_id: &str,
        data: &str,
    ) -> Result<(), RunnerError> {
        let child_tx = {
            let mut tasks = self.tasks.lock().await;
            let io = tasks.get_mut(task_id).ok_or(RunnerError::NotWaiting)?;
            let pending = io.pending.as_ref().ok_or(RunnerError::NotWaiting)?;
            if pending.request_id != request_id {
                return Err(RunnerError::InputMismatch);
            }
            io.pending = None;
            io.child_tx.clone()
        };
        self.resolve_prompt(task_id, request_id, data, child_tx).await
    }

    async fn on_input_deadline(self: &Arc<Self>, task_id: &str, request_id: &str) {
        let child_tx = {
            let mut tasks = self.tasks.lock().await;
            let Some(io) = tasks.get_mut(task_id) else {
                return;
            };
            match &io.pending {
                Some(pending)
                    if pending.request_id == request_id && pending.deadline <= Instant::now() =>
                {
                    io.pending = None;
                    io.child_tx.clone()
                }
                _ => return,
            }
        };
        tracing::warn!(task = %task_id, request_id, "No input received, assuming newline");
        if self
            .resolve_prompt(task_id, request_id, DEFAULT_INPUT, child_tx)
            .await
            .is_ok()
        {
            // Hint consumers that this prompt is closed.
            let hint = Envelope::termination(
                task_id,
                Some(request_id),
                serde_json::json!({ "detail": "input timeout" }),
            );
            self.publish_with_retry(&input_request_channel(task_id), &hint)
                .await;
        }
    }

    async fn resolve_prompt(
        &self,
        task_id: &str,
        request_id: &str,
        data: &str,
        child_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<(), RunnerError> {
        let flip = self
            .db
            .call({
                let task_id = task_id.to_string();
                move |db| {
                    db.update_task_status(
                        &task_id,
                        TaskStatus::WaitingForInput,
                        TaskStatus::Running,
                        StatusPatch {
                            input_request_id: Some(None),
                            ..Default::default()
                        },
                    )
                }
            })
            .await;
        if let Err(RunnerError::Conflict(_)) = flip {
            // Terminal transition won the race; the prompt no longer exists.
            return Err(RunnerError::NotWaiting);
        }
        flip?;

        let envelope = Envelope::input_response(task_id, request_id, data);
        if let Some(tx) = child_tx {
            let line = serde_json::to_string(&envelope).expect("envelope serialize");
            if tx.send(line).is_err() {
                tracing::warn!(task = %task_id, "Child gone before input delivery");
            }
        } else {
            tracing::warn!(task = %task_id, "No child connection for input delivery");
        }
        self.publish_with_retry(&input_response_channel(task_id), &envelope)
            .await;
        self.append_output(task_id, &envelope).await;
        self.publish_status(task_id, TaskStatus::Running, serde_json::Value::Null)
            .await;
        Ok(())
    }

    /// A protocol violation is fatal to the task: mark FAILED, discard the
    /// pending entry, and broadcast the terminal status so the owning
    /// worker tears the process down.
    async fn fatal_protocol(&self, task_id: &str, detail: &str) {
        tracing::error!(task = %task_id, detail, "Child protocol violation");
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(io) = tasks.get_mut(task_id) {
                io.pending = None;
            }
        }
        let results = serde_json::json!({ "error": detail, "reason": "protocol" });
        let finished = self
            .db
            .call({
                let task_id = task_id.to_string();
                let results = results.clone();
                move |db| db.finish_task(&task_id, TaskStatus::Failed, Some(results))
            })
            .await;
        match finished {
            Ok(Some(_)) => {
                self.publish_status(task_id, TaskStatus::Failed, results).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(task = %task_id, error = %e, "Failed to record protocol violation")
            }
        }
    }

    async fn append_output(&self, task_id: &str, envelope: &Envelope) {
        let per_task = task_output_stream(task_id);
        let result = bus::retry("append output", || {
            let bus = Arc::clone(&self.bus);
            let per_task = per_task.clone();
            let envelope = envelope.clone();
            async move {
                bus.xadd(&per_task, &envelope).await?;
                bus.xadd(COMMON_OUTPUT_STREAM, &envelope).await?;
                Ok(())
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(task = %task_id, error = %e, "Output append exhausted retries");
            self.fail_task_infrastructure(task_id).await;
        }
    }

    async fn publish_with_retry(&self, topic: &str, envelope: &Envelope) {
        let result = bus::retry("publish", || {
            let bus = Arc::clone(&self.bus);
            let topic = topic.to_string();
            let envelope = envelope.clone();
            async move { bus.publish(&topic, &envelope).await }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(topic, error = %e, "Publish exhausted retries");
        }
    }

    async fn publish_status(&self, task_id: &str, status: TaskStatus, detail: serde_json::Value) {
        let envelope = Envelope::status(task_id, status, detail);
        self.publish_with_retry(&status_channel(task_id), &envelope)
            .await;
    }

    async fn fail_task_infrastructure(&self, task_id: &str) {
        let results = serde_json::json!({
            "error": "Stream backend unavailable",
            "reason": "infrastructure",
        });
        let _ = self
            .db
            .call({
                let task_id = task_id.to_string();
                move |db| db.finish_task(&task_id, TaskStatus::Failed, Some(results))
            })
            .await;
        self.publish_status(task_id, TaskStatus::Failed, serde_json::Value::Null)
            .await;
    }
}
