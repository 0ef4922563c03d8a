use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::{JobId, JobPriority};
use crate::queue::JobRef;

/// Job status lifecycle
///
/// ```text
/// Pending ──> Running ──> Completed
///    │  ^        │  │
///    │  └────────┘  └──> Failed ──(retry_job)──> Pending
///    └──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted and waiting for `scheduled_at`, a queue slot, or a worker
    Pending,

    /// Claimed by a worker and executing
    Running,

    /// Handler returned a result
    Completed,

    /// Retries exhausted, permanent error, or configuration error
    Failed,

    /// Cancelled while pending
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state (completed, failed, or cancelled)
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal moves of the state machine. Same-status rewrites are allowed for
    /// `Pending` (rescheduling) and `Running` (heartbeats).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Category of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Handler returned a retryable error
    Handler,
    /// Handler returned a permanent error
    Permanent,
    /// Handler exceeded its timeout
    Timeout,
    /// Handler panicked
    Panic,
    /// Task name did not resolve to a registered handler
    Configuration,
    /// Worker stopped heartbeating while the job was running
    Stale,
}

impl FailureKind {
    /// Failures of these kinds never go back to the queue automatically
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Permanent | Self::Configuration)
    }
}

/// Structured failure description stored on the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Durable job record owned by storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue_name: String,
    pub priority: JobPriority,
    pub status: JobStatus,

    /// Not eligible for execution before this instant
    pub scheduled_at: DateTime<Utc>,

    /// Failed attempts so far
    pub retries: u32,
    pub max_retries: u32,

    pub result: Option<Value>,
    pub error: Option<JobFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last liveness stamp from the worker running this job
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new pending job record
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        queue_name: impl Into<String>,
        priority: JobPriority,
        scheduled_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            task_name: task_name.into(),
            args,
            kwargs,
            queue_name: queue_name.into(),
            priority,
            status: JobStatus::Pending,
            scheduled_at,
            retries: 0,
            max_retries,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
        }
    }

    /// Pending and past its scheduled time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether another attempt is allowed after the failures recorded so far
    pub fn can_retry(&self) -> bool {
        self.retries <= self.max_retries
    }

    /// Ephemeral queue reference for this job
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            queue_name: self.queue_name.clone(),
            priority: self.priority,
            scheduled_at: self.scheduled_at,
        }
    }

    /// Last instant the job was known to be alive while running
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.started_at)
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Count a failed attempt and decide between retry and terminal failure.
    /// Returns `true` when the job was rescheduled.
    pub fn record_failure(&mut self, failure: JobFailure, retry_at: Option<DateTime<Utc>>) -> bool {
        let now = failure.at;
        self.retries += 1;

        let rescheduled = match retry_at {
            Some(at) if !failure.kind.is_terminal() && self.can_retry() => {
                self.status = JobStatus::Pending;
                self.scheduled_at = at;
                self.started_at = None;
                self.heartbeat_at = None;
                true
            }
            _ => {
                self.status = JobStatus::Failed;
                self.completed_at = Some(now);
                false
            }
        };

        self.error = Some(failure);
        self.updated_at = now;
        rescheduled
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Manual retry from FAILED: due immediately, retry count preserved
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.scheduled_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.heartbeat_at = None;
        self.updated_at = now;
    }
}
