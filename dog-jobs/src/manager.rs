use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::JobsConfig;
use crate::engine::{validate_queue_name, Engine};
use crate::observability::{BoxStream, LiveMetrics};
use crate::queue::PriorityQueue;
use crate::scheduler::{PeriodicJob, Scheduler, TickReport};
use crate::storage::JobStorage;
use crate::task::{TaskArgs, TaskDescriptor, TaskHandler, TaskRegistry};
use crate::worker::{panic_message, WorkerPool};
use crate::{JobError, JobEvent, JobId, JobOptions, JobRecord, JobStatus, JobsError, JobsResult};

struct Running {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Entry point of the job engine: owns storage, the queue, the scheduler
/// and the worker pool
///
/// ```no_run
/// use dog_jobs::prelude::*;
/// use serde_json::{json, Map};
///
/// # async fn demo() -> JobsResult<()> {
/// let manager = JobManager::new(MemoryStorage::new());
/// manager.register_task(
///     "echo",
///     handler_fn(|args: TaskArgs| async move { Ok(args.to_value()) }),
///     None,
///     None,
///     None,
/// );
///
/// manager.start().await?;
/// let id = manager.enqueue("echo", vec![json!("hi")], Map::new(), JobOptions::new()).await?;
/// let job = manager.get_job(&id).await?;
/// manager.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobManager {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    running: Mutex<Option<Running>>,
}

impl JobManager {
    /// Manager with default configuration and the system clock
    pub fn new(storage: impl JobStorage + 'static) -> Self {
        Self::with_config(storage, JobsConfig::default())
    }

    pub fn with_config(storage: impl JobStorage + 'static, config: JobsConfig) -> Self {
        Self::from_parts(Arc::new(storage), config, Arc::new(SystemClock))
    }

    /// Full control over the storage handle and the time source
    pub fn from_parts(storage: Arc<dyn JobStorage>, config: JobsConfig, clock: Arc<dyn Clock>) -> Self {
        let engine = Arc::new(Engine::new(storage, config, clock));
        Self {
            scheduler: Arc::new(Scheduler::new(engine.clone())),
            engine,
            running: Mutex::new(None),
        }
    }

    /// Register a task handler with its defaults
    pub fn register_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        description: Option<String>,
        max_retries: Option<u32>,
        queue: Option<String>,
    ) {
        self.engine
            .registry
            .register_task(name, handler, description, max_retries, queue);
    }

    /// Register a fully-specified task (timeout, backoff)
    pub fn register(&self, descriptor: TaskDescriptor) {
        self.engine.registry.register(descriptor);
    }

    pub fn register_periodic(&self, job: PeriodicJob) -> JobsResult<()> {
        self.scheduler.register_periodic(job)
    }

    /// Persist a new job. The task does not have to be registered yet.
    #[instrument(skip(self, args, kwargs, options), fields(task = %task_name))]
    pub async fn enqueue(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: JobOptions,
    ) -> JobsResult<JobId> {
        self.engine.enqueue(task_name, args, kwargs, options).await
    }

    pub async fn get_job(&self, id: &JobId) -> JobsResult<JobRecord> {
        self.engine.storage.get(id).await
    }

    /// Cancel a PENDING job. Returns `false` for jobs in any other state,
    /// including RUNNING ones.
    pub async fn cancel_job(&self, id: &JobId) -> JobsResult<bool> {
        let mut job = self.engine.storage.get(id).await?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }

        let now = self.engine.now();
        job.cancel(now);
        match self.engine.storage.update(&job).await {
            Ok(()) => {}
            // A worker claimed it in the meantime
            Err(JobsError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.engine.queue.remove(id);
        self.engine.observability.emit(
            &job.task_name,
            JobEvent::Cancelled {
                job_id: job.id.clone(),
                at: now,
            },
        );
        info!("Cancelled job {}", id);
        Ok(true)
    }

    /// Send a FAILED job back to PENDING, due now, keeping its retry count
    pub async fn retry_job(&self, id: &JobId) -> JobsResult<bool> {
        let mut job = self.engine.storage.get(id).await?;
        if job.status != JobStatus::Failed {
            return Ok(false);
        }

        let now = self.engine.now();
        job.requeue(now);
        match self.engine.storage.update(&job).await {
            Ok(()) => {}
            Err(JobsError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.engine.queue.push(job.job_ref());
        self.engine.observability.emit(
            &job.task_name,
            JobEvent::Requeued {
                job_id: job.id.clone(),
                at: now,
            },
        );
        info!("Requeued failed job {}", id);
        Ok(true)
    }

    pub fn pause_queue(&self, queue_name: &str) -> JobsResult<()> {
        validate_queue_name(queue_name)?;
        self.engine.queue.pause(queue_name);
        info!("Paused queue {}", queue_name);
        Ok(())
    }

    pub fn resume_queue(&self, queue_name: &str) -> JobsResult<()> {
        validate_queue_name(queue_name)?;
        self.engine.queue.resume(queue_name);
        info!("Resumed queue {}", queue_name);
        Ok(())
    }

    /// Drop the queue's entries and cancel its persisted PENDING jobs.
    /// Returns the number of jobs cancelled.
    pub async fn clear_queue(&self, queue_name: &str) -> JobsResult<usize> {
        validate_queue_name(queue_name)?;
        self.engine.queue.clear(queue_name);
        let cancelled = self.engine.storage.clear(queue_name, self.engine.now()).await?;
        info!("Cleared queue {}: {} jobs cancelled", queue_name, cancelled);
        Ok(cancelled)
    }

    pub async fn get_pending_jobs(&self) -> JobsResult<Vec<JobRecord>> {
        self.engine.storage.get_jobs_by_status(&[JobStatus::Pending]).await
    }

    pub async fn get_completed_jobs(&self) -> JobsResult<Vec<JobRecord>> {
        self.engine.storage.get_jobs_by_status(&[JobStatus::Completed]).await
    }

    pub async fn get_failed_jobs(&self) -> JobsResult<Vec<JobRecord>> {
        self.engine.storage.get_jobs_by_status(&[JobStatus::Failed]).await
    }

    /// PENDING jobs persisted for the queue, due or not
    pub async fn get_queue_length(&self, queue_name: &str) -> JobsResult<usize> {
        self.engine.storage.get_queue_length(queue_name).await
    }

    /// Run a task inline on the caller's task: no storage, no retries
    #[instrument(skip(self, args, kwargs), fields(task = %task_name))]
    pub async fn run_job_sync(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> JobsResult<Value> {
        let task = self.engine.registry.resolve(task_name)?;
        let call = AssertUnwindSafe(task.handler.call(TaskArgs::new(args, kwargs))).catch_unwind();

        let result = match task.timeout.or(self.engine.config.handler_timeout) {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| JobsError::Timeout(limit))?,
            None => call.await,
        };

        match result {
            Ok(outcome) => Ok(outcome?),
            Err(payload) => Err(JobsError::Handler(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(&*payload)
            )))),
        }
    }

    /// Promote due jobs and reap stale RUNNING ones; `start` calls this first
    pub async fn recover(&self) -> JobsResult<usize> {
        let promoted = self.engine.promote_due().await?;
        let reaped = self.engine.reap_stale().await?;
        if promoted + reaped > 0 {
            info!("Recovered {} pending and {} stale jobs", promoted, reaped);
        }
        Ok(promoted + reaped)
    }

    /// Queue every due PENDING job that is not queued yet
    pub async fn promote_due(&self) -> JobsResult<usize> {
        self.engine.promote_due().await
    }

    /// Run one scheduler iteration by hand
    pub async fn tick(&self) -> JobsResult<TickReport> {
        self.scheduler.tick().await
    }

    /// Start the scheduler and the workers. Does nothing if already running.
    pub async fn start(&self) -> JobsResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.recover().await?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let config = &self.engine.config;
        if config.effective_heartbeat_interval() < config.heartbeat_interval {
            warn!(
                "Heartbeat interval {:?} is too long for stale_after {:?}, using {:?}",
                config.heartbeat_interval,
                config.stale_after,
                config.effective_heartbeat_interval()
            );
        }

        let shutdown = CancellationToken::new();
        let mut handles = WorkerPool::spawn(self.engine.clone(), shutdown.clone()).into_handles();
        handles.push(tokio::spawn(self.scheduler.clone().run(shutdown.clone())));

        info!(
            "Job manager started with {} workers on queues {:?}",
            self.engine.config.worker_count, self.engine.config.queues
        );
        *running = Some(Running { shutdown, handles });
        Ok(())
    }

    /// Signal shutdown and wait up to `shutdown_timeout` for in-flight jobs;
    /// whatever is still running after that is aborted and left RUNNING for
    /// the reaper. Does nothing if not started.
    ///
    /// Async handlers are cancelled at their next await point. A
    /// [`blocking_fn`](crate::blocking_fn) closure cannot be interrupted and
    /// runs to completion on the blocking pool.
    pub async fn stop(&self) -> JobsResult<()> {
        let Some(mut running) = self.running.lock().take() else {
            return Ok(());
        };

        info!("Stopping job manager");
        running.shutdown.cancel();

        let timeout = self.engine.config.shutdown_timeout;
        let all_done = futures::future::join_all(running.handles.iter_mut());
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!("Shutdown timed out after {:?}, aborting in-flight jobs", timeout);
            for handle in &running.handles {
                handle.abort();
            }
            // Handlers die with their worker; wait until every worker is gone
            futures::future::join_all(running.handles.iter_mut()).await;
        }

        info!("Job manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        self.engine.observability.event_stream()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        self.engine.observability.metrics()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.engine.registry
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.engine.queue
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.engine.storage
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &JobsConfig {
        &self.engine.config
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_ref() {
            running.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::task::handler_fn;
    use serde_json::json;
    use tracing_test::traced_test;

    #[traced_test]
    #[tokio::test]
    async fn lifecycle_operations_are_logged() {
        let manager = JobManager::new(MemoryStorage::new());
        manager.register_task(
            "echo",
            handler_fn(|args: TaskArgs| async move { Ok(args.to_value()) }),
            None,
            None,
            None,
        );

        let id = manager
            .enqueue("echo", vec![json!(1)], Map::new(), JobOptions::new())
            .await
            .unwrap();
        assert!(manager.cancel_job(&id).await.unwrap());
        manager.pause_queue("default").unwrap();

        assert!(logs_contain("Registered task: echo"));
        assert!(logs_contain(&format!("Cancelled job {}", id)));
        assert!(logs_contain("Paused queue default"));
    }

    #[tokio::test]
    async fn run_job_sync_reports_panics_and_timeouts() {
        let manager = JobManager::new(MemoryStorage::new());
        manager.register_task(
            "explodes",
            handler_fn(|_args: TaskArgs| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
            None,
            None,
            None,
        );
        manager.register(
            TaskDescriptor::new(
                "slow",
                handler_fn(|_args: TaskArgs| async move {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }),
            )
            .with_timeout(std::time::Duration::from_millis(20)),
        );

        let err = manager.run_job_sync("explodes", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, JobsError::Handler(JobError::Retryable(msg)) if msg.contains("boom")));

        let err = manager.run_job_sync("slow", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, JobsError::Timeout(_)));
    }
}
