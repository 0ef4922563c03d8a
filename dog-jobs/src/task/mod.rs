pub mod registry;

pub use registry::{TaskDescriptor, TaskRegistry};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

use crate::JobError;

/// Positional and keyword arguments handed to a task, exactly as enqueued
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Deserialize a positional argument; a missing or mistyped argument is a
    /// permanent error since retrying cannot fix it
    pub fn parse_arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self
            .arg(index)
            .ok_or_else(|| JobError::permanent(format!("missing argument {}", index)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| JobError::permanent(format!("argument {}: {}", index, e)))
    }

    /// Deserialize a keyword argument, `None` when absent
    pub fn parse_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JobError> {
        self.kwarg(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| JobError::permanent(format!("argument {:?}: {}", name, e)))
            })
            .transpose()
    }

    /// `{"args": [...], "kwargs": {...}}`
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "args": self.args,
            "kwargs": self.kwargs,
        })
    }
}

/// Type-erased task implementation resolved by name at execution time
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: TaskArgs) -> Result<Value, JobError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn call(&self, args: TaskArgs) -> Result<Value, JobError> {
        (self.f)(args).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct BlockingHandler<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> TaskHandler for BlockingHandler<F>
where
    F: Fn(TaskArgs) -> Result<Value, JobError> + Send + Sync + 'static,
{
    async fn call(&self, args: TaskArgs) -> Result<Value, JobError> {
        let f = self.f.clone();
        match tokio::task::spawn_blocking(move || f(args)).await {
            Ok(result) => result,
            // Re-raise so the caller sees the same panic an async handler would produce
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(JobError::retryable(format!("blocking task aborted: {}", e))),
        }
    }
}

/// Wrap a synchronous closure; it runs on tokio's blocking pool
pub fn blocking_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskArgs) -> Result<Value, JobError> + Send + Sync + 'static,
{
    Arc::new(BlockingHandler { f: Arc::new(f) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TaskArgs {
        let mut kwargs = Map::new();
        kwargs.insert("k".to_string(), json!("v"));
        TaskArgs::new(vec![json!("a"), json!(2)], kwargs)
    }

    #[test]
    fn to_value_has_args_and_kwargs() {
        assert_eq!(sample().to_value(), json!({"args": ["a", 2], "kwargs": {"k": "v"}}));
    }

    #[test]
    fn parse_errors_are_permanent() {
        let args = sample();
        assert_eq!(args.parse_arg::<u32>(1).unwrap(), 2);
        assert!(!args.parse_arg::<u32>(0).unwrap_err().is_retryable());
        assert!(!args.parse_arg::<String>(5).unwrap_err().is_retryable());
        assert_eq!(args.parse_kwarg::<String>("k").unwrap().as_deref(), Some("v"));
        assert_eq!(args.parse_kwarg::<String>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let async_handler = handler_fn(|args: TaskArgs| async move { Ok(json!(args.args.len())) });
        let blocking_handler = blocking_fn(|args: TaskArgs| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(json!(args.kwargs.len()))
        });

        assert_eq!(async_handler.call(sample()).await.unwrap(), json!(2));
        assert_eq!(blocking_handler.call(sample()).await.unwrap(), json!(1));
    }
}
