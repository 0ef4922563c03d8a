use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Queues the workers serve; empty means every queue with entries
    pub queues: Vec<String>,
    /// Worker sleep when every served queue is empty
    pub poll_interval: Duration,
    /// Scheduler tick
    pub scheduler_interval: Duration,
    /// How often a worker refreshes `heartbeat_at` while a handler runs
    pub heartbeat_interval: Duration,
    /// RUNNING jobs silent for longer than this are reaped
    pub stale_after: Duration,
    /// How long `stop` waits for in-flight jobs before aborting them
    pub shutdown_timeout: Duration,
    /// Retry ceiling when neither the job nor its task sets one
    pub default_max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Per-attempt limit for tasks without their own timeout
    pub handler_timeout: Option<Duration>,
    /// Attempts for a failing storage call inside a worker
    pub storage_retry_attempts: u32,
    pub storage_retry_delay: Duration,
    /// Buffered events per subscriber before lagging ones drop events
    pub event_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queues: Vec::new(),
            poll_interval: Duration::from_millis(100),
            scheduler_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            backoff: BackoffPolicy::default(),
            handler_timeout: None,
            storage_retry_attempts: 3,
            storage_retry_delay: Duration::from_millis(50),
            event_capacity: 1000,
        }
    }
}

impl JobsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `DOG_JOBS_*` environment variables; unset or unparsable
    /// values keep their defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let num = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let millis = |key: &str, default: Duration| Duration::from_millis(num(key, default.as_millis() as u64));
        let secs = |key: &str, default: Duration| Duration::from_secs(num(key, default.as_secs()));

        let queues = lookup("DOG_JOBS_QUEUES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let backoff = BackoffPolicy::exponential(
            secs("DOG_JOBS_BACKOFF_BASE_SECS", Duration::from_secs(1)),
            secs("DOG_JOBS_BACKOFF_MAX_SECS", Duration::from_secs(3600)),
        );
        let backoff = if num("DOG_JOBS_BACKOFF_JITTER", 0) != 0 {
            backoff.with_jitter()
        } else {
            backoff
        };

        let handler_timeout = lookup("DOG_JOBS_HANDLER_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            worker_count: num("DOG_JOBS_WORKER_COUNT", defaults.worker_count as u64).max(1) as usize,
            queues,
            poll_interval: millis("DOG_JOBS_POLL_INTERVAL_MS", defaults.poll_interval),
            scheduler_interval: millis("DOG_JOBS_SCHEDULER_INTERVAL_MS", defaults.scheduler_interval),
            heartbeat_interval: secs("DOG_JOBS_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            stale_after: secs("DOG_JOBS_STALE_AFTER_SECS", defaults.stale_after),
            shutdown_timeout: secs("DOG_JOBS_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
            default_max_retries: num("DOG_JOBS_MAX_RETRIES", defaults.default_max_retries as u64) as u32,
            backoff,
            handler_timeout,
            storage_retry_attempts: num(
                "DOG_JOBS_STORAGE_RETRY_ATTEMPTS",
                defaults.storage_retry_attempts as u64,
            )
            .max(1) as u32,
            storage_retry_delay: millis("DOG_JOBS_STORAGE_RETRY_DELAY_MS", defaults.storage_retry_delay),
            event_capacity: num("DOG_JOBS_EVENT_CAPACITY", defaults.event_capacity as u64).max(1) as usize,
        }
    }

    /// Heartbeat period the workers actually use: never more than a third of
    /// `stale_after`, so a live job always refreshes before the reaper sees it
    pub fn effective_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
            .min(self.stale_after / 3)
            .max(Duration::from_millis(1))
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_scheduler_interval(mut self, scheduler_interval: Duration) -> Self {
        self.scheduler_interval = scheduler_interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_storage_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.storage_retry_attempts = attempts.max(1);
        self.storage_retry_delay = delay;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.worker_count, 4);
        assert!(config.queues.is_empty());
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.default_max_retries, 3);
        assert!(config.handler_timeout.is_none());
    }

    #[test]
    fn reads_environment_overrides() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("DOG_JOBS_WORKER_COUNT", "8"),
            ("DOG_JOBS_QUEUES", "emails, reports,,"),
            ("DOG_JOBS_POLL_INTERVAL_MS", "25"),
            ("DOG_JOBS_MAX_RETRIES", "0"),
            ("DOG_JOBS_BACKOFF_BASE_SECS", "2"),
            ("DOG_JOBS_BACKOFF_MAX_SECS", "60"),
            ("DOG_JOBS_HANDLER_TIMEOUT_SECS", "10"),
        ]));

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queues, vec!["emails".to_string(), "reports".to_string()]);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.default_max_retries, 0);
        assert_eq!(
            config.backoff,
            BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(60))
        );
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn heartbeat_is_clamped_below_stale_threshold() {
        let config = JobsConfig::default();
        assert_eq!(config.effective_heartbeat_interval(), Duration::from_secs(30));

        let config = JobsConfig::default()
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_stale_after(Duration::from_millis(300));
        assert_eq!(config.effective_heartbeat_interval(), Duration::from_millis(100));

        let config = JobsConfig::default().with_stale_after(Duration::ZERO);
        assert_eq!(config.effective_heartbeat_interval(), Duration::from_millis(1));
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("DOG_JOBS_WORKER_COUNT", "many"),
            ("DOG_JOBS_STALE_AFTER_SECS", "-1"),
            ("DOG_JOBS_HANDLER_TIMEOUT_SECS", "0"),
        ]));

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert!(config.handler_timeout.is_none());
    }
}
