use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::TaskHandler;
use crate::backoff::BackoffPolicy;
use crate::{JobsError, JobsResult};

/// A registered task: its handler plus the defaults applied to its jobs
#[derive(Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub description: Option<String>,

    /// Retry ceiling for jobs that do not override it
    pub max_retries: Option<u32>,

    /// Queue used when the job does not name one
    pub queue: Option<String>,

    /// Per-attempt execution limit
    pub timeout: Option<Duration>,

    /// Overrides the engine-wide backoff policy
    pub backoff: Option<BackoffPolicy>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            description: None,
            max_retries: None,
            queue: None,
            timeout: None,
            backoff: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("max_retries", &self.max_retries)
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Name-to-handler map shared by the manager and every worker
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskDescriptor>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; a later registration under the same name replaces it
    pub fn register(&self, descriptor: TaskDescriptor) {
        let name = descriptor.name.clone();
        let previous = self.tasks.write().insert(name.clone(), Arc::new(descriptor));
        if previous.is_some() {
            warn!("Task {} re-registered, replacing previous handler", name);
        } else {
            info!("Registered task: {}", name);
        }
    }

    /// Positional form of [`TaskRegistry::register`]
    pub fn register_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        description: Option<String>,
        max_retries: Option<u32>,
        queue: Option<String>,
    ) {
        let mut descriptor = TaskDescriptor::new(name, handler);
        descriptor.description = description;
        descriptor.max_retries = max_retries;
        descriptor.queue = queue;
        self.register(descriptor);
    }

    pub fn resolve(&self, name: &str) -> JobsResult<Arc<TaskDescriptor>> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobsError::TaskNotRegistered(name.to_string()))
    }

    /// Lookup without the error, for callers that only need defaults
    pub fn get(&self, name: &str) -> Option<Arc<TaskDescriptor>> {
        self.tasks.read().get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{handler_fn, TaskArgs};
    use serde_json::json;

    fn constant(value: i64) -> Arc<dyn TaskHandler> {
        handler_fn(move |_args: TaskArgs| async move { Ok(json!(value)) })
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = TaskRegistry::new();
        registry.register(TaskDescriptor::new("answer", constant(1)));
        registry.register(TaskDescriptor::new("answer", constant(42)).with_max_retries(7));

        let task = registry.resolve("answer").unwrap();
        assert_eq!(task.max_retries, Some(7));
        assert_eq!(task.handler.call(TaskArgs::default()).await.unwrap(), json!(42));
        assert_eq!(registry.task_names(), vec!["answer".to_string()]);
    }

    #[test]
    fn unknown_task_is_not_registered() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("nope").unwrap_err();
        assert!(matches!(err, JobsError::TaskNotRegistered(name) if name == "nope"));
        assert!(!registry.is_registered("nope"));
    }

    #[test]
    fn register_task_carries_defaults() {
        let registry = TaskRegistry::new();
        registry.register_task(
            "mail",
            constant(0),
            Some("send an email".to_string()),
            Some(5),
            Some("emails".to_string()),
        );

        let task = registry.get("mail").unwrap();
        assert_eq!(task.description.as_deref(), Some("send an email"));
        assert_eq!(task.queue.as_deref(), Some("emails"));
        assert_eq!(task.max_retries, Some(5));
    }
}
