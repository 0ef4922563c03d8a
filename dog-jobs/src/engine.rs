use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::JobsConfig;
use crate::observability::ObservabilityLayer;
use crate::queue::PriorityQueue;
use crate::reaper::StaleJobReaper;
use crate::storage::JobStorage;
use crate::task::{TaskDescriptor, TaskRegistry};
use crate::{JobEvent, JobId, JobOptions, JobRecord, JobStatus, JobsError, JobsResult};

/// Queue used when neither the job nor its task names one
pub const DEFAULT_QUEUE: &str = "default";

const MAX_QUEUE_NAME_LEN: usize = 128;

/// Reject empty, overlong, or oddly-charactered queue names
pub fn validate_queue_name(name: &str) -> JobsResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(JobsError::InvalidQueueName(name.to_string()))
    }
}

/// State shared by the manager, the scheduler and every worker
pub(crate) struct Engine {
    pub(crate) storage: Arc<dyn JobStorage>,
    pub(crate) queue: PriorityQueue,
    pub(crate) registry: TaskRegistry,
    pub(crate) observability: ObservabilityLayer,
    pub(crate) reaper: StaleJobReaper,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: JobsConfig,
}

impl Engine {
    pub(crate) fn new(storage: Arc<dyn JobStorage>, config: JobsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: PriorityQueue::new(clock.clone()),
            registry: TaskRegistry::new(),
            observability: ObservabilityLayer::new(config.event_capacity),
            reaper: StaleJobReaper::new(storage.clone(), config.stale_after),
            storage,
            clock,
            config,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a new PENDING job and queue it if it is already due
    pub(crate) async fn enqueue(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: JobOptions,
    ) -> JobsResult<JobId> {
        let task = self.registry.get(task_name);

        let queue_name = options
            .queue_name
            .or_else(|| task.as_ref().and_then(|t| t.queue.clone()))
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        validate_queue_name(&queue_name)?;

        let max_retries = options
            .max_retries
            .or_else(|| task.as_ref().and_then(|t| t.max_retries))
            .unwrap_or(self.config.default_max_retries);

        let now = self.now();
        let scheduled_at = options.scheduled_at.unwrap_or(now);
        let job = JobRecord::new(
            task_name,
            args,
            kwargs,
            queue_name,
            options.priority,
            scheduled_at,
            max_retries,
            now,
        );

        self.storage.save(&job).await?;

        self.observability.emit(
            task_name,
            JobEvent::Enqueued {
                job_id: job.id.clone(),
                task_name: job.task_name.clone(),
                queue: job.queue_name.clone(),
                scheduled_at,
                at: now,
            },
        );
        info!("Enqueued job {} of task {} on queue {}", job.id, task_name, job.queue_name);

        // Subscribers see Enqueued before any worker can emit Started
        if job.is_due(now) {
            self.queue.push(job.job_ref());
        }
        Ok(job.id)
    }

    /// Push every due PENDING job that is not already queued. Safe to call
    /// repeatedly or concurrently: the queue keeps one entry per job.
    pub(crate) async fn promote_due(&self) -> JobsResult<usize> {
        let now = self.now();
        let pending = self.storage.get_jobs_by_status(&[JobStatus::Pending]).await?;

        let promoted = pending
            .iter()
            .filter(|job| job.is_due(now))
            .filter(|job| self.queue.push(job.job_ref()))
            .count();

        if promoted > 0 {
            debug!("Promoted {} due jobs", promoted);
        }
        Ok(promoted)
    }

    /// Reap stale RUNNING jobs and queue the ones that went back to PENDING
    pub(crate) async fn reap_stale(&self) -> JobsResult<usize> {
        let now = self.now();
        let reaped = self.reaper.reap(now).await?;

        for job in &reaped {
            let Some(error) = job.error.clone() else { continue };
            if job.status == JobStatus::Pending {
                self.queue.push(job.job_ref());
                warn!("Job {} went stale, requeued (attempt {})", job.id, job.retries);
                self.observability.emit(
                    &job.task_name,
                    JobEvent::Retrying {
                        job_id: job.id.clone(),
                        retry_at: job.scheduled_at,
                        error,
                        at: now,
                    },
                );
            } else {
                warn!("Job {} went stale and exhausted its retries", job.id);
                self.observability.emit(
                    &job.task_name,
                    JobEvent::Failed {
                        job_id: job.id.clone(),
                        error,
                        at: now,
                    },
                );
            }
        }

        Ok(reaped.len())
    }

    /// Retry delay for the attempt that follows `retries` failures
    pub(crate) fn backoff_delay(&self, task: Option<&TaskDescriptor>, retries: u32) -> chrono::Duration {
        let policy = task
            .and_then(|t| t.backoff.as_ref())
            .unwrap_or(&self.config.backoff);
        chrono::Duration::from_std(policy.delay_for(retries)).unwrap_or(chrono::Duration::MAX)
    }

    /// Repeat a storage call on `JobsError::Storage` up to the configured
    /// attempts; other errors return immediately
    pub(crate) async fn with_storage_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> JobsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JobsResult<T>>,
    {
        let attempts = self.config.storage_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_storage() && attempt < attempts => {
                    warn!("Storage {} failed (attempt {}/{}): {}", operation, attempt, attempts, e);
                    tokio::time::sleep(self.config.storage_retry_delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine(clock: ManualClock) -> Engine {
        let config = JobsConfig::default().with_storage_retry(3, std::time::Duration::from_millis(1));
        Engine::new(Arc::new(MemoryStorage::new()), config, Arc::new(clock))
    }

    #[test]
    fn queue_name_rules() {
        assert!(validate_queue_name("default").is_ok());
        assert!(validate_queue_name("emails.high:v2-x_y").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("with space").is_err());
        assert!(validate_queue_name("slash/queue").is_err());
        assert!(validate_queue_name(&"q".repeat(128)).is_ok());
        assert!(validate_queue_name(&"q".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn future_jobs_are_promoted_once_due() {
        let clock = ManualClock::starting_now();
        let engine = engine(clock.clone());

        let options = JobOptions::new().with_scheduled_at(clock.now() + chrono::Duration::hours(1));
        let id = engine.enqueue("later", vec![], Map::new(), options).await.unwrap();
        assert!(!engine.queue.contains(&id));
        assert_eq!(engine.promote_due().await.unwrap(), 0);

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(engine.promote_due().await.unwrap(), 1);
        assert_eq!(engine.promote_due().await.unwrap(), 0);
        assert_eq!(engine.queue.len(DEFAULT_QUEUE), 1);
    }

    #[tokio::test]
    async fn storage_retry_stops_at_the_configured_attempts() {
        let engine = engine(ManualClock::starting_now());
        let calls = AtomicU32::new(0);

        let result: JobsResult<()> = engine
            .with_storage_retry("save", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(JobsError::Storage("disk full".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_storage_errors_are_not_retried() {
        let engine = engine(ManualClock::starting_now());
        let calls = AtomicU32::new(0);

        let result: JobsResult<()> = engine
            .with_storage_retry("get", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(JobsError::JobNotFound("x".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(JobsError::JobNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
