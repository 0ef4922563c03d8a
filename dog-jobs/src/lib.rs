//! # dog-jobs: Async Job Queue and Scheduling Engine
//!
//! Background task execution for DogRS hosts: named priority queues,
//! delayed and periodic jobs, retry with backoff, and pluggable storage.
//!
//! ## Features
//!
//! - **Priority dispatch**: `Critical > High > Normal > Low`, FIFO within a priority
//! - **Delayed jobs**: nothing runs before its `scheduled_at`
//! - **Retries**: per-task ceilings, exponential/linear/fixed backoff, permanent errors
//! - **Crash recovery**: durable [`FileStorage`], heartbeats and a stale-job reaper
//! - **Periodic jobs**: fixed intervals or cron expressions (`cron-scheduling`)
//! - **Observability**: `tracing` spans, an event stream and live counters
//!
//! ## Quick Start
//!
//! ```no_run
//! use dog_jobs::prelude::*;
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> JobsResult<()> {
//!     let manager = JobManager::with_config(MemoryStorage::new(), JobsConfig::from_env());
//!
//!     manager.register(
//!         TaskDescriptor::new(
//!             "send_email",
//!             handler_fn(|args: TaskArgs| async move {
//!                 let to: String = args.parse_arg(0)?;
//!                 Ok(json!({ "sent_to": to }))
//!             }),
//!         )
//!         .with_queue("emails")
//!         .with_max_retries(5),
//!     );
//!
//!     manager.start().await?;
//!
//!     let id = manager
//!         .enqueue(
//!             "send_email",
//!             vec![json!("ops@example.com")],
//!             Map::new(),
//!             JobOptions::new().with_priority(JobPriority::High),
//!         )
//!         .await?;
//!
//!     println!("{:?}", manager.get_job(&id).await?.status);
//!     manager.stop().await
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod queue;
pub mod reaper;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod types;

mod engine;
mod worker;

// Core API exports
pub use manager::JobManager;
pub use types::{FailureKind, JobEvent, JobFailure, JobId, JobOptions, JobPriority, JobRecord, JobStatus};
pub use error::{JobError, JobsError, JobsResult};
pub use engine::{validate_queue_name, DEFAULT_QUEUE};

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JobsConfig;
pub use queue::{JobRef, PriorityQueue};
pub use reaper::StaleJobReaper;
pub use scheduler::{PeriodicJob, Schedule, Scheduler, TickReport};
pub use storage::{FileStorage, JobStorage, MemoryStorage};
pub use task::{blocking_fn, handler_fn, TaskArgs, TaskDescriptor, TaskHandler, TaskRegistry};

// Observability exports
pub use observability::{BoxStream, LiveMetrics, MetricsSnapshot, ObservabilityLayer, TaskMetrics};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything a host needs to register tasks and enqueue jobs
pub mod prelude {
    pub use crate::{JobManager, JobsConfig, JobStorage, MemoryStorage, FileStorage};

    pub use crate::{
        JobId, JobOptions, JobPriority, JobRecord, JobStatus, JobError, JobsError, JobsResult,
    };

    pub use crate::{blocking_fn, handler_fn, TaskArgs, TaskDescriptor, TaskHandler};

    pub use crate::{BackoffPolicy, PeriodicJob, Schedule};

    pub use crate::{JobEvent, LiveMetrics};

    pub use async_trait::async_trait;
}
