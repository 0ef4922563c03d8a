use thiserror::Error;

use crate::types::JobStatus;

/// Result type for engine operations
pub type JobsResult<T> = Result<T, JobsError>;

/// Infrastructure and configuration errors surfaced by the engine
#[derive(Error, Debug, Clone)]
pub enum JobsError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Task not registered: {0}")]
    TaskNotRegistered(String),

    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task execution failed: {0}")]
    Handler(#[from] JobError),

    #[error("Task execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobsError {
    /// Whether the error came from the storage layer and the operation may succeed if repeated
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

// Handlers written with `?` on arbitrary errors get retry semantics.
impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for JobsError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_become_retryable() {
        let err: JobError = anyhow::anyhow!("connection reset").into();
        assert!(err.is_retryable());
        assert_eq!(err.message(), "connection reset");
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = JobsError::InvalidTransition {
            job_id: "abc".to_string(),
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for job abc: completed -> running"
        );
    }
}
