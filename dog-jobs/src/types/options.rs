use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobPriority;

/// Per-enqueue overrides; anything left unset falls back to the task's
/// registered defaults and then to the engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Target queue name
    pub queue_name: Option<String>,

    /// Job priority for ordering
    pub priority: JobPriority,

    /// When the job becomes eligible; `None` means now
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Retry ceiling for this job only
    pub max_retries: Option<u32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target queue
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Set the job priority
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set when the job should run
    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Override the task's retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
