use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Engine;
use crate::queue::JobRef;
use crate::task::{TaskArgs, TaskDescriptor};
use crate::{FailureKind, JobError, JobEvent, JobFailure, JobRecord, JobsError};

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// How one handler attempt ended
enum Outcome {
    Success(Value),
    Failure(JobFailure),
}

impl Outcome {
    fn from_join(
        result: Result<Result<Value, JobError>, JoinError>,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        match result {
            Ok(Ok(value)) => Self::Success(value),
            Ok(Err(JobError::Retryable(message))) => {
                Self::Failure(JobFailure::new(FailureKind::Handler, message, at))
            }
            Ok(Err(JobError::Permanent(message))) => {
                Self::Failure(JobFailure::new(FailureKind::Permanent, message, at))
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(&*e.into_panic());
                Self::Failure(JobFailure::new(FailureKind::Panic, format!("handler panicked: {}", message), at))
            }
            Err(e) => Self::Failure(JobFailure::new(FailureKind::Handler, format!("handler aborted: {}", e), at)),
        }
    }
}

/// Handles to the running workers
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers sharing `shutdown`
    pub(crate) fn spawn(engine: Arc<Engine>, shutdown: CancellationToken) -> Self {
        let handles = (0..engine.config.worker_count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    engine: engine.clone(),
                    shutdown: shutdown.clone(),
                    cursor: id,
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles }
    }

    pub(crate) fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

/// Worker for processing jobs from queues
struct Worker {
    id: usize,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    /// Round-robin position over the served queues
    cursor: usize,
}

impl Worker {
    /// Run the worker loop. A job already claimed is finished before the
    /// shutdown signal is honored.
    async fn run(mut self) {
        info!("Worker {} started", self.id);

        while !self.shutdown.is_cancelled() {
            match self.next_job() {
                Some(job_ref) => self.process(job_ref).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.engine.config.poll_interval) => {}
                    }
                }
            }
        }

        info!("Worker {} stopped", self.id);
    }

    fn next_job(&mut self) -> Option<JobRef> {
        let queues = if self.engine.config.queues.is_empty() {
            self.engine.queue.queue_names()
        } else {
            self.engine.config.queues.clone()
        };
        if queues.is_empty() {
            return None;
        }

        let start = self.cursor % queues.len();
        for offset in 0..queues.len() {
            let index = (start + offset) % queues.len();
            if let Some(job_ref) = self.engine.queue.pop(&queues[index]) {
                self.cursor = index + 1;
                return Some(job_ref);
            }
        }
        None
    }

    #[instrument(skip(self, job_ref), fields(worker = self.id, job_id = %job_ref.id))]
    async fn process(&self, job_ref: JobRef) {
        let engine = &self.engine;
        let now = engine.now();

        let claimed = engine
            .with_storage_retry("claim", || engine.storage.claim(&job_ref.id, now))
            .await;
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("Job {} is no longer runnable, skipped", job_ref.id);
                return;
            }
            Err(e) => {
                error!("Could not claim job {}: {}", job_ref.id, e);
                return;
            }
        };

        engine.observability.emit(
            &job.task_name,
            JobEvent::Started {
                job_id: job.id.clone(),
                task_name: job.task_name.clone(),
                attempt: job.retries + 1,
                at: now,
            },
        );
        debug!("Processing job {} of task {}", job.id, job.task_name);

        let task = match engine.registry.resolve(&job.task_name) {
            Ok(task) => task,
            Err(e) => {
                let failure = JobFailure::new(FailureKind::Configuration, e.to_string(), engine.now());
                self.finish_failed(job, failure, None).await;
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.execute(&job, &task).await;
        engine
            .observability
            .metrics()
            .record_execution_time(&job.task_name, started.elapsed());

        match outcome {
            Outcome::Success(value) => self.finish_completed(job, value).await,
            Outcome::Failure(failure) => self.finish_failed(job, failure, Some(&task)).await,
        }
    }

    /// Run the handler on its own task (so panics are contained), with the
    /// optional timeout, refreshing the heartbeat while it runs
    async fn execute(&self, job: &JobRecord, task: &TaskDescriptor) -> Outcome {
        let engine = &self.engine;
        let handler = task.handler.clone();
        let args = TaskArgs::new(job.args.clone(), job.kwargs.clone());
        // Handler is cancelled if this future is dropped
        let mut handle = AbortOnDropHandle::new(tokio::spawn(async move { handler.call(args).await }));

        let limit = task.timeout.or(engine.config.handler_timeout);
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let period = engine.config.effective_heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut handle => return Outcome::from_join(result, engine.now()),

                _ = &mut deadline => {
                    handle.abort();
                    let limit = limit.unwrap_or_default();
                    warn!("Job {} exceeded its {:?} timeout", job.id, limit);
                    return Outcome::Failure(JobFailure::new(
                        FailureKind::Timeout,
                        JobsError::Timeout(limit).to_string(),
                        engine.now(),
                    ));
                }

                _ = heartbeat.tick() => {
                    match engine.storage.heartbeat(&job.id, engine.now()).await {
                        Ok(true) => debug!("Heartbeat for job {}", job.id),
                        Ok(false) => warn!("Job {} is no longer RUNNING in storage", job.id),
                        Err(e) => warn!("Heartbeat for job {} failed: {}", job.id, e),
                    }
                }
            }
        }
    }

    async fn finish_completed(&self, mut job: JobRecord, value: Value) {
        let engine = &self.engine;
        let now = engine.now();
        job.complete(value, now);

        if let Err(e) = engine.with_storage_retry("update", || engine.storage.update(&job)).await {
            self.report_lost_write(&job, &e);
            return;
        }

        engine.observability.emit(
            &job.task_name,
            JobEvent::Completed {
                job_id: job.id.clone(),
                at: now,
            },
        );
        info!("Job {} completed successfully", job.id);
    }

    async fn finish_failed(&self, mut job: JobRecord, failure: JobFailure, task: Option<&TaskDescriptor>) {
        let engine = &self.engine;
        let now = failure.at;
        let retry_at = now + engine.backoff_delay(task, job.retries + 1);
        let rescheduled = job.record_failure(failure.clone(), Some(retry_at));

        if let Err(e) = engine.with_storage_retry("update", || engine.storage.update(&job)).await {
            self.report_lost_write(&job, &e);
            return;
        }

        if rescheduled {
            engine.queue.push(job.job_ref());
            warn!(
                "Job {} failed, will retry at {} (retry {}/{}): {}",
                job.id, retry_at, job.retries, job.max_retries, failure
            );
            engine.observability.emit(
                &job.task_name,
                JobEvent::Retrying {
                    job_id: job.id.clone(),
                    retry_at,
                    error: failure,
                    at: now,
                },
            );
        } else {
            error!("Job {} failed permanently: {}", job.id, failure);
            engine.observability.emit(
                &job.task_name,
                JobEvent::Failed {
                    job_id: job.id.clone(),
                    error: failure,
                    at: now,
                },
            );
        }
    }

    fn report_lost_write(&self, job: &JobRecord, err: &JobsError) {
        match err {
            JobsError::InvalidTransition { .. } => {
                warn!("Result of job {} discarded: {}", job.id, err);
            }
            _ => {
                error!("Could not persist job {} ({}), leaving it for the reaper: {}", job.id, job.status, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new("kaboom".to_string());
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(&*from_str), "boom");
        assert_eq!(panic_message(&*from_string), "kaboom");
        assert_eq!(panic_message(&*other), "unknown panic payload");
    }

    #[tokio::test]
    async fn join_outcomes_map_to_failure_kinds() {
        let at = chrono::Utc::now();

        let permanent = Outcome::from_join(Ok(Err(JobError::permanent("bad input"))), at);
        assert!(matches!(permanent, Outcome::Failure(f) if f.kind == FailureKind::Permanent));

        let handle: JoinHandle<Result<Value, JobError>> = tokio::spawn(async { panic!("exploded") });
        match Outcome::from_join(handle.await, at) {
            Outcome::Failure(f) => {
                assert_eq!(f.kind, FailureKind::Panic);
                assert!(f.message.contains("exploded"));
            }
            Outcome::Success(_) => panic!("expected failure"),
        }
    }
}
