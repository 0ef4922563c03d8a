use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{validate_queue_name, Engine};
use crate::{JobOptions, JobsError, JobsResult};

/// When a periodic job fires
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval, first fire one interval after registration
    Every(Duration),

    /// Cron expression (seconds field included), evaluated in UTC
    #[cfg(feature = "cron-scheduling")]
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn every(interval: Duration) -> JobsResult<Self> {
        if interval.is_zero() {
            return Err(JobsError::InvalidSchedule("interval must be positive".to_string()));
        }
        Ok(Self::Every(interval))
    }

    #[cfg(feature = "cron-scheduling")]
    pub fn cron(expression: &str) -> JobsResult<Self> {
        use std::str::FromStr;

        cron::Schedule::from_str(expression)
            .map(|schedule| Self::Cron(Box::new(schedule)))
            .map_err(|e| JobsError::InvalidSchedule(format!("{}: {}", expression, e)))
    }

    /// First fire time strictly after `after`; `None` once a cron schedule is exhausted
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|step| after.checked_add_signed(step)),
            #[cfg(feature = "cron-scheduling")]
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// A recurring job definition; each fire enqueues a fresh job
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub name: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub options: JobOptions,
    pub schedule: Schedule,
}

impl PeriodicJob {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            options: JobOptions::default(),
            schedule,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

struct PeriodicEntry {
    job: PeriodicJob,
    next_run: DateTime<Utc>,
}

/// What one scheduler tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub periodic_enqueued: usize,
    pub reaped: usize,
}

/// Single loop that moves due jobs into the queue, fires periodic jobs and
/// reaps stale ones
pub struct Scheduler {
    engine: Arc<Engine>,
    periodic: Mutex<Vec<PeriodicEntry>>,
}

impl Scheduler {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            periodic: Mutex::new(Vec::new()),
        }
    }

    /// Add a periodic job; one with the same name is replaced
    pub fn register_periodic(&self, job: PeriodicJob) -> JobsResult<()> {
        if let Some(queue_name) = &job.options.queue_name {
            validate_queue_name(queue_name)?;
        }

        let now = self.engine.now();
        let next_run = job
            .schedule
            .next_after(now)
            .ok_or_else(|| JobsError::InvalidSchedule(format!("{} never fires", job.name)))?;

        info!("Registered periodic job {} (task {}), first run at {}", job.name, job.task_name, next_run);
        let mut periodic = self.periodic.lock();
        periodic.retain(|entry| entry.job.name != job.name);
        periodic.push(PeriodicEntry { job, next_run });
        Ok(())
    }

    /// Names of the registered periodic jobs with their next fire time
    pub fn periodic_jobs(&self) -> Vec<(String, DateTime<Utc>)> {
        self.periodic
            .lock()
            .iter()
            .map(|entry| (entry.job.name.clone(), entry.next_run))
            .collect()
    }

    /// One scheduler iteration
    pub async fn tick(&self) -> JobsResult<TickReport> {
        let promoted = self.engine.promote_due().await?;
        let periodic_enqueued = self.fire_periodic().await?;
        let reaped = self.engine.reap_stale().await?;

        Ok(TickReport {
            promoted,
            periodic_enqueued,
            reaped,
        })
    }

    async fn fire_periodic(&self) -> JobsResult<usize> {
        let now = self.engine.now();

        // Snapshot due entries under the lock; enqueue outside it
        let due: Vec<PeriodicJob> = self
            .periodic
            .lock()
            .iter()
            .filter(|entry| entry.next_run <= now)
            .map(|entry| entry.job.clone())
            .collect();

        let mut enqueued = 0;
        for job in due {
            debug!("Firing periodic job {}", job.name);
            let name = job.name.clone();
            let next_run = job.schedule.next_after(now);
            if let Err(e) = self
                .engine
                .enqueue(&job.task_name, job.args, job.kwargs, job.options)
                .await
            {
                // Fire time stays put, so the next tick tries again
                error!("Periodic job {} could not be enqueued: {}", name, e);
                continue;
            }
            enqueued += 1;

            // Missed fires collapse into one
            let mut periodic = self.periodic.lock();
            match next_run {
                Some(next_run) => {
                    if let Some(entry) = periodic.iter_mut().find(|entry| entry.job.name == name) {
                        entry.next_run = next_run;
                    }
                }
                None => {
                    info!("Periodic job {} has no further runs", name);
                    periodic.retain(|entry| entry.job.name != name);
                }
            }
        }
        Ok(enqueued)
    }

    /// Tick every `scheduler_interval` until `shutdown` fires. A tick in
    /// progress runs to completion.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.engine.config.scheduler_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler started with interval: {:?}", self.engine.config.scheduler_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutdown requested");
                    break;
                }

                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => {
                            debug!(
                                "Scheduler tick: {} promoted, {} periodic, {} reaped",
                                report.promoted, report.periodic_enqueued, report.reaped
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Scheduler tick failed: {}", e),
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}
