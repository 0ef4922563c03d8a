use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters for engine activity
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_requeued: AtomicU64,

    // Per-task breakdown
    task_metrics: RwLock<HashMap<String, TaskMetrics>>,
}

/// Counters and execution timings for one task name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub total_execution: Duration,
    pub max_execution: Duration,
}

impl TaskMetrics {
    /// Mean time per finished attempt
    pub fn avg_execution(&self) -> Option<Duration> {
        let finished = self.completed + self.failed + self.retried;
        if finished == 0 {
            None
        } else {
            let nanos = self.total_execution.as_nanos() / u128::from(finished);
            Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
        }
    }

    /// Completed share of terminal outcomes, as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            100.0
        } else {
            self.completed as f64 / total as f64 * 100.0
        }
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub requeued: u64,
    pub tasks: HashMap<String, TaskMetrics>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_task(&self, task_name: &str, update: impl FnOnce(&mut TaskMetrics)) {
        let mut tasks = self.task_metrics.write();
        update(tasks.entry(task_name.to_string()).or_default());
    }

    pub fn increment_jobs_enqueued(&self, task_name: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.enqueued += 1);
    }

    pub fn increment_jobs_started(&self, task_name: &str) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.started += 1);
    }

    pub fn increment_jobs_completed(&self, task_name: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.completed += 1);
    }

    pub fn increment_jobs_failed(&self, task_name: &str) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.failed += 1);
    }

    pub fn increment_jobs_retried(&self, task_name: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.retried += 1);
    }

    pub fn increment_jobs_cancelled(&self, task_name: &str) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        self.with_task(task_name, |m| m.cancelled += 1);
    }

    pub fn increment_jobs_requeued(&self) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one handler attempt took
    pub fn record_execution_time(&self, task_name: &str, elapsed: Duration) {
        self.with_task(task_name, |m| {
            m.total_execution += elapsed;
            m.max_execution = m.max_execution.max(elapsed);
        });
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.load(Ordering::Relaxed)
    }

    pub fn jobs_requeued(&self) -> u64 {
        self.jobs_requeued.load(Ordering::Relaxed)
    }

    /// Metrics for a specific task
    pub fn task_metrics(&self, task_name: &str) -> Option<TaskMetrics> {
        self.task_metrics.read().get(task_name).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.jobs_enqueued(),
            started: self.jobs_started(),
            completed: self.jobs_completed(),
            failed: self.jobs_failed(),
            retried: self.jobs_retried(),
            cancelled: self.jobs_cancelled(),
            requeued: self.jobs_requeued(),
            tasks: self.task_metrics.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_per_task() {
        let metrics = LiveMetrics::new();
        metrics.increment_jobs_enqueued("mail");
        metrics.increment_jobs_enqueued("mail");
        metrics.increment_jobs_enqueued("report");
        metrics.increment_jobs_completed("mail");
        metrics.increment_jobs_failed("mail");
        metrics.record_execution_time("mail", Duration::from_millis(30));
        metrics.record_execution_time("mail", Duration::from_millis(10));

        assert_eq!(metrics.jobs_enqueued(), 3);
        let mail = metrics.task_metrics("mail").unwrap();
        assert_eq!(mail.enqueued, 2);
        assert_eq!(mail.success_rate(), 50.0);
        assert_eq!(mail.avg_execution(), Some(Duration::from_millis(20)));
        assert_eq!(mail.max_execution, Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.completed, 1);
    }

    #[test]
    fn average_survives_counts_beyond_u32() {
        let metrics = TaskMetrics {
            completed: 1 << 32,
            total_execution: Duration::from_secs(1 << 32),
            ..TaskMetrics::default()
        };
        assert_eq!(metrics.avg_execution(), Some(Duration::from_secs(1)));

        let idle = TaskMetrics::default();
        assert_eq!(idle.avg_execution(), None);
    }
}
