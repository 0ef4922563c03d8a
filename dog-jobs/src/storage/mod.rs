pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{JobId, JobRecord, JobStatus, JobsError, JobsResult};

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Durable home of job records
///
/// `update` is last-writer-wins, but only for writes that are a legal move of
/// the job state machine and do not decrease `retries`. Anything else is
/// rejected with [`JobsError::InvalidTransition`] and leaves the record as it
/// was.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Persist a new record; fails with `DuplicateJob` if the id exists
    async fn save(&self, job: &JobRecord) -> JobsResult<()>;

    /// Load a record by id
    async fn get(&self, id: &JobId) -> JobsResult<JobRecord>;

    /// Replace a record, subject to the transition rule
    async fn update(&self, job: &JobRecord) -> JobsResult<()>;

    /// Atomically move a due PENDING job to RUNNING. Returns `None` when the
    /// job is in any other state or not yet due.
    async fn claim(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<Option<JobRecord>>;

    /// Refresh `heartbeat_at` of a RUNNING job; `false` if it is no longer running
    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<bool>;

    /// Records in any of `statuses`, oldest first
    async fn get_jobs_by_status(&self, statuses: &[JobStatus]) -> JobsResult<Vec<JobRecord>>;

    /// PENDING records persisted for `queue_name`
    async fn get_queue_length(&self, queue_name: &str) -> JobsResult<usize>;

    /// Cancel every PENDING record of `queue_name`; returns how many changed
    async fn clear(&self, queue_name: &str, now: DateTime<Utc>) -> JobsResult<usize>;

    /// Remove a record outright
    async fn delete(&self, id: &JobId) -> JobsResult<bool>;
}

/// Check that `next` may replace `current`
pub(crate) fn validate_update(current: &JobRecord, next: &JobRecord) -> JobsResult<()> {
    if !current.status.can_transition_to(next.status) || next.retries < current.retries {
        return Err(JobsError::InvalidTransition {
            job_id: next.id.to_string(),
            from: current.status,
            to: next.status,
        });
    }
    Ok(())
}
