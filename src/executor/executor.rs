//! Worker Pool Implementation
//!
//! Manages the lifecycle of task execution. It spawns workers that continuously poll the
//! `TaskQueue` for claimable tasks.
//!
//! ## Responsibilities
//! - **Polling**: claiming `Pending` tasks (or tasks whose lease expired).
//! - **Lease Management**: a sidecar task renews the lease while the handler runs.
//! - **Isolation**: every handler runs in its own spawned task. Whatever it loads (ciphertexts,
//!   engine responses) is owned by that task and dropped when it ends; a panic is contained
//!   and recorded as a permanent failure instead of taking the worker down.
//! - **Outcome**: success acknowledges the task; failure goes through the queue's retry policy
//!   and, once terminal, the kind's failure hook, after which the failed row is dropped.

use super::queue::TaskQueue;
use super::registry::TaskHandlerRegistry;
use super::types::*;
use crate::error::{Result, TallyError};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Sleep between polls when no task is claimable.
    pub poll_interval: Duration,
    /// How often a running task's lease is renewed.
    pub lease_renewal_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(50),
            lease_renewal_interval: Duration::from_secs(10),
        }
    }
}

/// The engine that drives task execution.
pub struct TaskExecutor {
    /// Source of tasks.
    queue: Arc<TaskQueue>,
    /// Registry containing the actual code (closures) for tasks.
    handlers: Arc<TaskHandlerRegistry>,
    config: ExecutorConfig,
    /// Prefix for worker names, unique per executor instance.
    instance: String,
    shutdown_tx: watch::Sender<bool>,
    /// Held shared by a worker from claim to acknowledgement; [`pause`](Self::pause) takes it
    /// exclusively.
    gate: RwLock<()>,
}

impl TaskExecutor {
    pub fn new(
        queue: Arc<TaskQueue>,
        handlers: Arc<TaskHandlerRegistry>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let instance = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        Arc::new(Self {
            queue,
            handlers,
            config,
            instance,
            shutdown_tx,
            gate: RwLock::new(()),
        })
    }

    /// Spawns long-lived workers and returns immediately.
    /// Workers run until [`shutdown`](Self::shutdown) is called.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting {} task workers", self.config.worker_count);

        (0..self.config.worker_count)
            .map(|worker_id| {
                let executor = self.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker_id, false).await;
                })
            })
            .collect()
    }

    /// Signals every worker to stop after its current task.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        tracing::info!("Task executor shutting down");
    }

    /// Runs workers until the queue has no pending or in-flight task left.
    pub async fn run_until_idle(self: &Arc<Self>) -> QueueStats {
        let handles: Vec<JoinHandle<()>> = (0..self.config.worker_count)
            .map(|worker_id| {
                let executor = self.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker_id, true).await;
                })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker exited abnormally: {}", e);
            }
        }

        self.queue.stats()
    }

    /// The main loop for a single worker.
    ///
    /// 1. Claims the next available task (atomic state change).
    /// 2. Executes it while maintaining a liveness lease.
    /// 3. With `drain` set, exits once the queue is idle; otherwise sleeps and polls again.
    async fn worker_loop(&self, worker_id: usize, drain: bool) {
        let worker = format!("{}-worker-{}", self.instance, worker_id);
        let mut shutdown = self.shutdown_tx.subscribe();
        tracing::debug!("Worker {} started", worker);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let running = self.gate.read().await;
            match self.queue.claim_next(&worker) {
                Some((task_id, entry)) => {
                    tracing::debug!(
                        "Worker {} claimed task {} ({}, attempt {})",
                        worker,
                        task_id,
                        entry.task.kind(),
                        entry.retry_count + 1
                    );
                    self.execute_with_lease(&worker, &task_id, entry.task).await;
                }
                None => {
                    drop(running);
                    if drain && self.queue.is_idle() {
                        break;
                    }
                    // Sleep if no work to avoid busy-waiting
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::debug!("Worker {} stopped", worker);
    }

    /// Wraps the actual execution with lease management and outcome handling.
    async fn execute_with_lease(&self, worker: &str, task_id: &TaskId, task: Task) {
        let renewal_handle = self.spawn_lease_renewal(worker, task_id);

        let result = self.execute_isolated(task.clone()).await;

        renewal_handle.abort();

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete_task(task_id) {
                    tracing::warn!("Could not acknowledge task {}: {}", task_id, e);
                }
            }
            Err(error) => {
                if self.queue.fail_task(task_id, &error) == FailureOutcome::Failed {
                    self.handlers.notify_failure(&task, error.to_string()).await;
                    self.queue.remove_failed(task_id);
                }
            }
        }
    }

    /// Runs the handler in its own spawned task.
    async fn execute_isolated(&self, task: Task) -> Result<()> {
        let handlers = self.handlers.clone();
        match tokio::spawn(async move { handlers.execute(&task).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(TallyError::Permanent(format!(
                "task handler aborted: {}",
                join_error
            ))),
        }
    }

    /// Spawns a background task to periodically renew the lease of a running task.
    fn spawn_lease_renewal(&self, worker: &str, task_id: &TaskId) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let task_id = task_id.clone();
        let worker = worker.to_string();
        let interval = self.config.lease_renewal_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                match queue.renew_lease(&task_id, &worker) {
                    Ok(_) => {
                        tracing::trace!("Renewed lease for task {}", task_id);
                    }
                    Err(_) => {
                        // Task might have finished or been reassigned
                        tracing::trace!("Task {} no longer needs lease renewal", task_id);
                        break;
                    }
                }
            }
        })
    }

    /// Waits for every in-flight task to be acknowledged and holds new claims back until the
    /// guard is dropped. While paused, the queue and the tables its handlers write are at rest.
    pub async fn pause(&self) -> RwLockWriteGuard<'_, ()> {
        let guard = self.gate.write().await;
        tracing::debug!("Task executor paused");
        guard
    }

    /// Operator override: fails a stuck task and runs its failure hook.
    pub async fn abandon(&self, task_id: &TaskId, reason: &str) -> Result<()> {
        let task = self.queue.abandon_task(task_id, reason)?;
        self.handlers.notify_failure(&task, reason.to_string()).await;
        self.queue.remove_failed(task_id);
        Ok(())
    }
}
