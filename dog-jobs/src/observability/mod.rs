pub mod metrics;

pub use metrics::{LiveMetrics, MetricsSnapshot, TaskMetrics};

use futures::StreamExt;
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::JobEvent;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Event fan-out plus live counters
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new(capacity: usize) -> Self {
        let (event_broadcaster, _) = broadcast::channel(capacity.max(1));
        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Count the event against `task_name` and broadcast it. Call only after
    /// the state it describes has been persisted.
    pub fn emit(&self, task_name: &str, event: JobEvent) {
        match &event {
            JobEvent::Enqueued { .. } => self.metrics.increment_jobs_enqueued(task_name),
            JobEvent::Started { .. } => self.metrics.increment_jobs_started(task_name),
            JobEvent::Retrying { .. } => self.metrics.increment_jobs_retried(task_name),
            JobEvent::Completed { .. } => self.metrics.increment_jobs_completed(task_name),
            JobEvent::Failed { .. } => self.metrics.increment_jobs_failed(task_name),
            JobEvent::Cancelled { .. } => self.metrics.increment_jobs_cancelled(task_name),
            JobEvent::Requeued { .. } => self.metrics.increment_jobs_requeued(),
        }

        debug!("Recorded job {}: {} ({})", event.event_name(), event.job_id(), task_name);
        // No subscribers is fine
        let _ = self.event_broadcaster.send(event);
    }

    /// Raw receiver; lagging receivers see `RecvError::Lagged`
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Event stream that skips over events a slow consumer missed
    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!("Event subscriber lagged, dropped {} events", missed);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Install a `tracing-subscriber` formatter filtered by `RUST_LOG`
/// (default `info`). Does nothing if a global subscriber is already set.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobId;
    use chrono::Utc;

    #[tokio::test]
    async fn emitted_events_reach_streams_and_counters() {
        let layer = ObservabilityLayer::new(16);
        let mut stream = layer.event_stream();
        let job_id = JobId::new();

        layer.emit(
            "mail",
            JobEvent::Completed {
                job_id: job_id.clone(),
                at: Utc::now(),
            },
        );

        let event = stream.next().await.unwrap();
        assert_eq!(event.job_id(), &job_id);
        assert_eq!(layer.metrics().jobs_completed(), 1);
        assert_eq!(layer.metrics().task_metrics("mail").unwrap().completed, 1);
    }

    #[tokio::test]
    async fn lagging_stream_skips_missed_events() {
        let layer = ObservabilityLayer::new(2);
        let mut stream = layer.event_stream();

        for _ in 0..5 {
            layer.emit(
                "t",
                JobEvent::Cancelled {
                    job_id: JobId::new(),
                    at: Utc::now(),
                },
            );
        }

        // Only the newest two survive in the channel
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        assert_eq!(layer.metrics().jobs_cancelled(), 5);
    }
}
