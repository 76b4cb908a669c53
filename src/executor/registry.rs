//! Task Handler Registry
//!
//! Maps each [`TaskKind`] to the async closure that executes it, plus an optional failure hook
//! that runs once a task of that kind is terminally failed. Keeping the orchestration logic
//! behind closures lets the queue and executor stay ignorant of what a task means.

use super::types::*;
use crate::error::{Result, TallyError};

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes a `Task` object and returns a Future that resolves to a `Result<()>`.
pub type TaskHandlerFn =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Invoked with the task and its final error message after terminal failure.
pub type FailureHookFn =
    Arc<dyn Fn(Task, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registry holding the mapping between task kinds and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<TaskKind, TaskHandlerFn>,
    failure_hooks: DashMap<TaskKind, FailureHookFn>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the handler for a task kind, replacing any previous one.
    pub fn register<F, Fut>(&self, kind: TaskKind, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so different async fns share one map.
        let handler_fn: TaskHandlerFn = Arc::new(move |task: Task| {
            Box::pin(handler(task)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        self.handlers.insert(kind, handler_fn);

        tracing::info!("Registered task handler: {}", kind);
    }

    /// Registers the hook run when a task of `kind` fails permanently.
    pub fn on_failure<F, Fut>(&self, kind: TaskKind, hook: F)
    where
        F: Fn(Task, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook_fn: FailureHookFn = Arc::new(move |task: Task, error: String| {
            Box::pin(hook(task, error)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        self.failure_hooks.insert(kind, hook_fn);
    }

    /// Looks up the handler for the task's kind and runs it.
    ///
    /// # Returns
    /// * `Ok(())` if the handler executed successfully.
    /// * `Err` if the handler failed or if no handler exists for the kind.
    pub async fn execute(&self, task: &Task) -> Result<()> {
        let kind = task.kind();
        // Clone the Arc out so no map guard is held across the await.
        let handler = self.handlers.get(&kind).map(|entry| entry.value().clone());

        match handler {
            Some(handler_fn) => {
                tracing::debug!("Executing {} task for chunk {}", kind, task.chunk_id());
                handler_fn(task.clone()).await
            }
            None => {
                let error = format!("Unknown task handler: {}", kind);
                tracing::error!("{}", error);
                Err(TallyError::Permanent(error))
            }
        }
    }

    /// Runs the failure hook for the task's kind, if one is registered.
    pub async fn notify_failure(&self, task: &Task, error: String) {
        let hook = self
            .failure_hooks
            .get(&task.kind())
            .map(|entry| entry.value().clone());

        if let Some(hook_fn) = hook {
            hook_fn(task.clone(), error).await;
        }
    }

    /// Returns the total number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
            failure_hooks: DashMap::new(),
        }
    }
}
