//! Typed error hierarchy for the runner.
//!
//! `RunnerError` covers every failure class the service distinguishes:
//! boundary rejections (auth, quota, validation), per-task protocol
//! failures, and transient infrastructure errors that the owning component
//! retries before surfacing.

use thiserror::Error;

/// Errors produced by the task execution core and its boundaries.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid or missing credentials")]
    AuthInvalid,

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error(
        "Cannot run more than {limit} tasks at the same time. Please wait for some tasks to finish"
    )]
    QuotaExceeded { limit: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Task is not waiting for input")]
    NotWaiting,

    #[error("Input request id does not match the outstanding prompt")]
    InputMismatch,

    #[error("Invalid state transition: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    ValidationFailed(String),

    #[error("Stream bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Protocol violation by child process: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RunnerError {
    /// Transient infrastructure errors are retried with capped backoff
    /// before they surface; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RunnerError::BusUnavailable(_)
                | RunnerError::StorageUnavailable(_)
                | RunnerError::PersistenceUnavailable(_)
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RunnerError::NotFound(what.into())
    }
}
