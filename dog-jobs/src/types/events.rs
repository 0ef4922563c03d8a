use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobFailure, JobId};

/// Lifecycle events broadcast after the corresponding state is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        task_name: String,
        queue: String,
        scheduled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// A worker moved the job to RUNNING
    Started {
        job_id: JobId,
        task_name: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: JobFailure,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Failed {
        job_id: JobId,
        error: JobFailure,
        at: DateTime<Utc>,
    },

    Cancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// FAILED job sent back to PENDING by `retry_job`
    Requeued {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Started { .. } => "started",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Requeued { .. } => "requeued",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::Requeued { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Started { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Requeued { at, .. } => *at,
        }
    }
}
