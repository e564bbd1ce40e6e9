//! The wire envelope carried on every stream and channel.
//!
//! All messages are JSON objects discriminated by `type`, with a shared
//! header (`task_id`, `timestamp`, optional `request_id`) and a per-variant
//! payload. Unknown types are rejected at the boundary by serde.
//!
//! ```json
//! { "type": "print", "task_id": "abc123", "timestamp": 1711210101210,
//!   "data": "Your log message" }
//! { "type": "input_request", "task_id": "abc123", "timestamp": ...,
//!   "data": "Enter your name:", "request_id": "req-uuid", "password": false }
//! { "type": "input_response", "task_id": "abc123", "timestamp": ...,
//!   "data": "John Doe", "request_id": "req-uuid" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{TaskStatus, now_ms};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Print {
        task_id: String,
        timestamp: i64,
        data: Value,
    },
    InputRequest {
        task_id: String,
        timestamp: i64,
        data: Value,
        /// Assigned by the mediator when the child omits it.
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        password: Option<bool>,
    },
    InputResponse {
        task_id: String,
        timestamp: i64,
        data: Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Termination {
        task_id: String,
        timestamp: i64,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Status {
        task_id: String,
        timestamp: i64,
        data: Value,
    },
}

impl Envelope {
    pub fn print(task_id: &str, data: impl Into<Value>) -> Self {
        Envelope::Print {
            task_id: task_id.to_string(),
            timestamp: now_ms(),
            data: data.into(),
        }
    }

    pub fn input_request(
        task_id: &str,
        request_id: &str,
        prompt: impl Into<Value>,
        password: bool,
    ) -> Self {
        Envelope::InputRequest {
            task_id: task_id.to_string(),
            timestamp: now_ms(),
            data: prompt.into(),
            request_id: Some(request_id.to_string()),
            password: Some(password),
        }
    }

    pub fn input_response(task_id: &str, request_id: &str, data: impl Into<Value>) -> Self {
        Envelope::InputResponse {
            task_id: task_id.to_string(),
            timestamp: now_ms(),
            data: data.into(),
            request_id: Some(request_id.to_string()),
        }
    }

    pub fn termination(task_id: &str, request_id: Option<&str>, data: impl Into<Value>) -> Self {
        Envelope::Termination {
            task_id: task_id.to_string(),
            timestamp: now_ms(),
            data: data.into(),
            request_id: request_id.map(|s| s.to_string()),
        }
    }

    /// A `status` envelope as published on `task:{id}:status`. The payload
    /// carries the status string plus any detail the transition produced.
    pub fn status(task_id: &str, status: TaskStatus, detail: Value) -> Self {
        Envelope::Status {
            task_id: task_id.to_string(),
            timestamp: now_ms(),
            data: serde_json::json!({
                "task_id": task_id,
                "status": status.as_str(),
                "data": detail,
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Print { .. } => "print",
            Envelope::InputRequest { .. } => "input_request",
            Envelope::InputResponse { .. } => "input_response",
            Envelope::Termination { .. } => "termination",
            Envelope::Status { .. } => "status",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Envelope::Print { task_id, .. }
            | Envelope::InputRequest { task_id, .. }
            | Envelope::InputResponse { task_id, .. }
            | Envelope::Termination { task_id, .. }
            | Envelope::Status { task_id, .. } => task_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Envelope::Print { timestamp, .. }
            | Envelope::InputRequest { timestamp, .. }
            | Envelope::InputResponse { timestamp, .. }
            | Envelope::Termination { timestamp, .. }
            | Envelope::Status { timestamp, .. } => *timestamp,
        }
    }

    pub fn set_timestamp(&mut self, ts: i64) {
        match self {
            Envelope::Print { timestamp, .. }
            | Envelope::InputRequest { timestamp, .. }
            | Envelope::InputResponse { timestamp, .. }
            | Envelope::Termination { timestamp, .. }
            | Envelope::Status { timestamp, .. } => *timestamp = ts,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Envelope::InputRequest { request_id, .. }
            | Envelope::InputResponse { request_id, .. }
            | Envelope::Termination { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            Envelope::Print { data, .. }
            | Envelope::InputRequest { data, .. }
            | Envelope::InputResponse { data, .. }
            | Envelope::Termination { data, .. }
            | Envelope::Status { data, .. } => data,
        }
    }

    /// Publishes are at-least-once; consumers dedupe on this key.
    pub fn dedupe_key(&self) -> (String, i64, &'static str, Option<String>) {
        (
            self.task_id().to_string(),
            self.timestamp(),
            self.kind(),
            self.request_id().map(|s| s.to_string()),
        )
    }

    /// Retag an envelope with the authoritative task id. Children are not
    /// trusted to stamp their own.
    pub fn with_task_id(mut self, id: &str) -> Self {
        match &mut self {
            Envelope::Print { task_id, .. }
            | Envelope::InputRequest { task_id, .. }
            | Envelope::InputResponse { task_id, .. }
            | Envelope::Termination { task_id, .. }
            | Envelope::Status { task_id, .. } => *task_id = id.to_string(),
        }
        self
    }
}

/// The minimal inbound input shape accepted from HTTP and WebSocket
/// clients: `{ "request_id": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPayload {
    pub request_id: String,
    pub data: String,
}

/// Parse a frame from a WebSocket client: either a full `input_response`
/// envelope or a bare `{request_id, data}` object.
pub fn parse_client_input(text: &str) -> Option<InputPayload> {
    if let Ok(env) = serde_json::from_str::<Envelope>(text) {
        if let Envelope::InputResponse {
            request_id: Some(rid),
            data,
            ..
        } = env
        {
            let data = match data {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Some(InputPayload {
                request_id: rid,
                data,
            });
        }
        return None;
    }
    serde_json::from_str::<InputPayload>(text).ok()
}
