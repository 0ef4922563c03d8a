use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::JobStorage;
use crate::{FailureKind, JobFailure, JobRecord, JobStatus, JobsError, JobsResult};

/// Reclaims RUNNING jobs whose worker stopped heartbeating
///
/// A reaped job counts as one failed attempt: it goes back to PENDING (due
/// immediately) while it is within `max_retries`, and to FAILED with
/// [`FailureKind::Stale`] after that.
pub struct StaleJobReaper {
    storage: Arc<dyn JobStorage>,
    stale_after: Duration,
}

impl StaleJobReaper {
    pub fn new(storage: Arc<dyn JobStorage>, stale_after: Duration) -> Self {
        Self { storage, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Whether a RUNNING job has been silent for longer than the threshold
    pub fn is_stale(&self, job: &JobRecord, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Running {
            return false;
        }
        let threshold = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        match job.last_seen() {
            Some(seen) => now.signed_duration_since(seen) > threshold,
            None => true,
        }
    }

    /// Run one reaper cycle; returns the records it rewrote
    pub async fn reap(&self, now: DateTime<Utc>) -> JobsResult<Vec<JobRecord>> {
        let running = self.storage.get_jobs_by_status(&[JobStatus::Running]).await?;
        let mut reaped = Vec::new();

        for mut job in running {
            if !self.is_stale(&job, now) {
                continue;
            }

            debug!("Reclaiming stale job: {}", job.id);
            let failure = JobFailure::new(
                FailureKind::Stale,
                format!("no heartbeat for more than {:?}", self.stale_after),
                now,
            );
            job.record_failure(failure, Some(now));

            match self.storage.update(&job).await {
                Ok(()) => reaped.push(job),
                // The worker finished between our read and write
                Err(JobsError::InvalidTransition { .. }) => {
                    debug!("Job {} changed while reaping, skipped", job.id);
                }
                Err(e) => {
                    warn!("Error reaping job {}: {}", job.id, e);
                }
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::JobPriority;
    use serde_json::Map;

    async fn running_job(storage: &MemoryStorage, max_retries: u32, started: DateTime<Utc>) -> JobRecord {
        let job = JobRecord::new("slow", vec![], Map::new(), "default", JobPriority::Normal, started, max_retries, started);
        storage.save(&job).await.unwrap();
        storage.claim(&job.id, started).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_jobs_are_left_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let now = Utc::now();
        running_job(&storage, 3, now).await;

        let reaper = StaleJobReaper::new(storage.clone(), Duration::from_secs(60));
        assert!(reaper.reap(now + chrono::Duration::seconds(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_job_within_budget_returns_to_pending() {
        let storage = Arc::new(MemoryStorage::new());
        let started = Utc::now();
        let job = running_job(&storage, 3, started).await;

        let reaper = StaleJobReaper::new(storage.clone(), Duration::from_secs(60));
        let now = started + chrono::Duration::minutes(2);
        let reaped = reaper.reap(now).await.unwrap();

        assert_eq!(reaped.len(), 1);
        let stored = storage.get(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retries, 1);
        assert_eq!(stored.scheduled_at, now);
        assert_eq!(stored.error.map(|e| e.kind), Some(FailureKind::Stale));
    }

    #[tokio::test]
    async fn stale_job_past_budget_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let started = Utc::now();
        let job = running_job(&storage, 0, started).await;

        let reaper = StaleJobReaper::new(storage.clone(), Duration::from_secs(60));
        reaper.reap(started + chrono::Duration::minutes(2)).await.unwrap();

        let stored = storage.get(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_keeps_job_alive() {
        let storage = Arc::new(MemoryStorage::new());
        let started = Utc::now();
        let job = running_job(&storage, 3, started).await;
        storage.heartbeat(&job.id, started + chrono::Duration::seconds(90)).await.unwrap();

        let reaper = StaleJobReaper::new(storage.clone(), Duration::from_secs(60));
        assert!(reaper.reap(started + chrono::Duration::seconds(120)).await.unwrap().is_empty());
    }
}
