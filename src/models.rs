use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task. Wire representation is uppercase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingForInput => "WAITING_FOR_INPUT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active tasks count against the per-client quota.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "WAITING_FOR_INPUT" => Ok(Self::WaitingForInput),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Validate a status transition against the task state machine.
///
/// ```text
/// PENDING ──dispatch──► RUNNING
/// RUNNING ──input_request──► WAITING_FOR_INPUT
/// WAITING_FOR_INPUT ──response or input-timeout──► RUNNING
/// RUNNING | WAITING_FOR_INPUT ──► COMPLETED | FAILED | CANCELLED
/// PENDING ──cancel before dispatch──► CANCELLED
/// ```
pub fn is_valid_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Running, WaitingForInput)
            | (WaitingForInput, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (WaitingForInput, Completed)
            | (WaitingForInput, Failed)
            | (WaitingForInput, Cancelled)
    )
}

/// A single execution of one flow file, owned by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub client_id: String,
    pub flow_id: String,
    pub filename: String,
    pub status: TaskStatus,
    /// Monotonic version bumped on every status write; used for optimistic
    /// concurrency in the persistence layer.
    pub status_version: i64,
    /// Seconds to wait for a response to an outstanding prompt.
    pub input_timeout: u64,
    /// Task max duration in seconds; 0 disables the limit.
    pub max_duration: u64,
    pub input_request_id: Option<String>,
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing)]
    pub soft_deleted: bool,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        !self.soft_deleted && self.status.is_active()
    }
}

/// An authenticated API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub audience: String,
    pub created_at: String,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, size: i64) -> Self {
        let pages = if size > 0 { (total + size - 1) / size } else { 0 };
        Self {
            items,
            total,
            page,
            size,
            pages,
        }
    }
}

/// Current UTC time as an RFC 3339 string, the format task records persist.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current UTC time in milliseconds since the epoch, the envelope clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in &[
            "PENDING",
            "RUNNING",
            "WAITING_FOR_INPUT",
            "COMPLETED",
            "FAILED",
            "CANCELLED",
        ] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("running".parse::<TaskStatus>().is_err());
        assert!("invalid".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serde_uppercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::WaitingForInput).unwrap(),
            "\"WAITING_FOR_INPUT\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"CANCELLED\"").unwrap(),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_terminal_and_active() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::WaitingForInput.is_terminal());

        assert!(TaskStatus::WaitingForInput.is_active());
        assert!(!TaskStatus::Cancelled.is_active());
    }

    #[test]
    fn test_valid_transitions() {
        use TaskStatus::*;
        assert!(is_valid_transition(&Pending, &Running));
        assert!(is_valid_transition(&Pending, &Cancelled));
        assert!(is_valid_transition(&Running, &WaitingForInput));
        assert!(is_valid_transition(&WaitingForInput, &Running));
        assert!(is_valid_transition(&Running, &Completed));
        assert!(is_valid_transition(&Running, &Failed));
        assert!(is_valid_transition(&Running, &Cancelled));
        assert!(is_valid_transition(&WaitingForInput, &Cancelled));
        assert!(is_valid_transition(&WaitingForInput, &Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use TaskStatus::*;
        // No way out of a terminal state.
        assert!(!is_valid_transition(&Completed, &Running));
        assert!(!is_valid_transition(&Failed, &Running));
        assert!(!is_valid_transition(&Cancelled, &Pending));
        assert!(!is_valid_transition(&Cancelled, &Cancelled));
        // PENDING cannot wait for input or complete without running.
        assert!(!is_valid_transition(&Pending, &WaitingForInput));
        assert!(!is_valid_transition(&Pending, &Completed));
        // Self transitions are not transitions.
        assert!(!is_valid_transition(&Running, &Running));
    }

    #[test]
    fn test_page_math() {
        let page = Page::new(vec![1, 2, 3], 10, 1, 3);
        assert_eq!(page.pages, 4);
        let page: Page<i32> = Page::new(vec![], 0, 1, 50);
        assert_eq!(page.pages, 0);
        let page: Page<i32> = Page::new(vec![], 100, 2, 50);
        assert_eq!(page.pages, 2);
    }

    #[test]
    fn test_task_is_active_respects_soft_delete() {
        let task = Task {
            id: "t1".into(),
            client_id: "c1".into(),
            flow_id: "f1".into(),
            filename: "a.flow".into(),
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
        };
        assert!(task.is_active());
        let deleted = Task {
            soft_deleted: true,
            ..task
        };
        assert!(!deleted.is_active());
    }
}
