use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{validate_update, JobStorage};
use crate::{JobId, JobRecord, JobStatus, JobsError, JobsResult};

/// Job map plus the mutation rules shared by every storage backend
#[derive(Debug, Default, Clone)]
pub(crate) struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
}

impl JobTable {
    pub(crate) fn save(&mut self, job: &JobRecord) -> JobsResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(JobsError::DuplicateJob(job.id.to_string()));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    pub(crate) fn get(&self, id: &JobId) -> JobsResult<JobRecord> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JobsError::JobNotFound(id.to_string()))
    }

    pub(crate) fn update(&mut self, job: &JobRecord) -> JobsResult<()> {
        let current = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| JobsError::JobNotFound(job.id.to_string()))?;
        validate_update(current, job)?;
        *current = job.clone();
        Ok(())
    }

    pub(crate) fn claim(&mut self, id: &JobId, now: DateTime<Utc>) -> JobsResult<Option<JobRecord>> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobsError::JobNotFound(id.to_string()))?;
        if !record.is_due(now) {
            return Ok(None);
        }
        record.start(now);
        Ok(Some(record.clone()))
    }

    pub(crate) fn heartbeat(&mut self, id: &JobId, now: DateTime<Utc>) -> JobsResult<bool> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobsError::JobNotFound(id.to_string()))?;
        if record.status != JobStatus::Running {
            return Ok(false);
        }
        record.heartbeat(now);
        Ok(true)
    }

    pub(crate) fn by_status(&self, statuses: &[JobStatus]) -> Vec<JobRecord> {
        let mut matching: Vec<JobRecord> = self
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    pub(crate) fn queue_length(&self, queue_name: &str) -> usize {
        self.jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.queue_name == queue_name)
            .count()
    }

    pub(crate) fn clear(&mut self, queue_name: &str, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for job in self.jobs.values_mut() {
            if job.status == JobStatus::Pending && job.queue_name == queue_name {
                job.cancel(now);
                cancelled += 1;
            }
        }
        cancelled
    }

    pub(crate) fn delete(&mut self, id: &JobId) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub(crate) fn from_records(records: Vec<JobRecord>) -> Self {
        Self {
            jobs: records.into_iter().map(|job| (job.id.clone(), job)).collect(),
        }
    }
}

/// In-memory storage for tests, development and single-process hosts
#[derive(Debug, Default)]
pub struct MemoryStorage {
    table: RwLock<JobTable>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, in any state
    pub fn len(&self) -> usize {
        self.table.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStorage for MemoryStorage {
    async fn save(&self, job: &JobRecord) -> JobsResult<()> {
        self.table.write().save(job)
    }

    async fn get(&self, id: &JobId) -> JobsResult<JobRecord> {
        self.table.read().get(id)
    }

    async fn update(&self, job: &JobRecord) -> JobsResult<()> {
        self.table.write().update(job)
    }

    async fn claim(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<Option<JobRecord>> {
        self.table.write().claim(id, now)
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<bool> {
        self.table.write().heartbeat(id, now)
    }

    async fn get_jobs_by_status(&self, statuses: &[JobStatus]) -> JobsResult<Vec<JobRecord>> {
        Ok(self.table.read().by_status(statuses))
    }

    async fn get_queue_length(&self, queue_name: &str) -> JobsResult<usize> {
        Ok(self.table.read().queue_length(queue_name))
    }

    async fn clear(&self, queue_name: &str, now: DateTime<Utc>) -> JobsResult<usize> {
        Ok(self.table.write().clear(queue_name, now))
    }

    async fn delete(&self, id: &JobId) -> JobsResult<bool> {
        Ok(self.table.write().delete(id))
    }
}
