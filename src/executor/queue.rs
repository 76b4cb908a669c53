//! Task Queue
//!
//! A partitioned, lease-based task queue. Tasks are assigned to partitions by hashing their ID
//! and stored as [`TaskEntry`] rows.
//!
//! ## Responsibilities
//! - **Publishing**: Storing new tasks as `Pending`.
//! - **Leasing**: Claiming a task sets a lease; a worker that dies stops renewing it and the task
//!   becomes claimable again once the lease expires (at-least-once delivery).
//! - **Retries**: Transient failures requeue the task with exponential backoff until the retry
//!   budget is spent; anything else is terminal.
//! - **Retention**: A completed task's row is deleted on acknowledgement. A failed row stays
//!   until the executor has run its failure hook, then is deleted too. Running totals of
//!   completed and failed tasks are kept as counters.

use super::types::*;
use crate::error::{Result, TallyError};
use crate::storage::memory::PartitionedMap;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// How many claimable candidates to collect from a partition per scan.
const CLAIM_SCAN_BATCH: usize = 8;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub partitions: u32,
    pub lease_ms: u64,
    /// Retries allowed after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 64,
            lease_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

/// The central component managing task state.
pub struct TaskQueue {
    /// Structure: `Partition ID -> Task ID -> TaskEntry`.
    tasks: PartitionedMap<TaskId, TaskEntry>,
    config: QueueConfig,
    /// Rotating start partition for claim scans, so workers spread across partitions.
    cursor: AtomicU32,
    done_total: AtomicUsize,
    failed_total: AtomicUsize,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            tasks: PartitionedMap::new(config.partitions),
            config,
            cursor: AtomicU32::new(0),
            done_total: AtomicUsize::new(0),
            failed_total: AtomicUsize::new(0),
        }
    }

    /// Enqueues a task. Delivery is at-least-once.
    pub fn publish(&self, task: Task) -> TaskId {
        let task_id = TaskId::new();
        tracing::debug!(
            "Publishing {} task {} for chunk {}",
            task.kind(),
            task_id,
            task.chunk_id()
        );
        self.tasks.insert(task_id.clone(), TaskEntry::new(task));
        task_id
    }

    pub fn publish_all(&self, tasks: impl IntoIterator<Item = Task>) -> Vec<TaskId> {
        tasks.into_iter().map(|task| self.publish(task)).collect()
    }

    /// Claims the next available task for `worker`, if any.
    ///
    /// Eligible tasks are:
    /// 1. Status is `Pending` and the backoff delay has elapsed.
    /// 2. Status is `InProgress` BUT the lease has expired (worker crashed).
    pub fn claim_next(&self, worker: &str) -> Option<(TaskId, TaskEntry)> {
        let partitions = self.tasks.num_partitions();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % partitions;
        let now = now_ms();

        for offset in 0..partitions {
            let partition = (start + offset) % partitions;
            let candidates =
                self.tasks
                    .scan_partition(partition, CLAIM_SCAN_BATCH, |entry| entry.is_claimable(now));

            for task_id in candidates {
                if let Some(entry) = self.try_claim_task(&task_id, worker) {
                    return Some((task_id, entry));
                }
            }
        }

        None
    }

    /// Attempts to lock a task for execution by `worker`.
    ///
    /// Re-checks eligibility under the row lock, since another worker might have raced us.
    pub fn try_claim_task(&self, task_id: &TaskId, worker: &str) -> Option<TaskEntry> {
        let lease_ms = self.config.lease_ms;
        self.tasks
            .update(task_id, |entry| {
                let now = now_ms();
                if !entry.is_claimable(now) {
                    return None;
                }

                if entry.status == TaskStatus::InProgress {
                    tracing::warn!(
                        "Lease on task {} held by {:?} expired, redelivering to {}",
                        task_id,
                        entry.assigned_to,
                        worker
                    );
                }

                entry.status = TaskStatus::InProgress;
                entry.assigned_to = Some(worker.to_string());
                entry.lease_expires = Some(now + lease_ms);

                tracing::debug!("Claimed task {} ({})", task_id, entry.task.kind());
                Some(entry.clone())
            })
            .flatten()
    }

    /// Extends the lease of a running task.
    /// Called periodically while the handler runs to prevent lease expiry.
    pub fn renew_lease(&self, task_id: &TaskId, worker: &str) -> Result<()> {
        let lease_ms = self.config.lease_ms;
        self.tasks
            .update(task_id, |entry| {
                if entry.status != TaskStatus::InProgress
                    || entry.assigned_to.as_deref() != Some(worker)
                {
                    return Err(TallyError::InvalidState(format!(
                        "task {} not held by {} (status: {:?})",
                        task_id, worker, entry.status
                    )));
                }
                entry.lease_expires = Some(now_ms() + lease_ms);
                Ok(())
            })
            .unwrap_or_else(|| Err(TallyError::not_found("task", task_id)))
    }

    /// Acknowledges a task: its row is deleted and the completed total incremented.
    /// A row that already went terminal (an operator abandoned it mid-run) is left alone.
    pub fn complete_task(&self, task_id: &TaskId) -> Result<()> {
        let found = self.tasks.compute(task_id.clone(), |slot| {
            match slot.as_ref().map(|entry| entry.status.is_terminal()) {
                None => false,
                Some(true) => {
                    tracing::debug!("Task {} already terminal", task_id);
                    true
                }
                Some(false) => {
                    *slot = None;
                    self.done_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Task {} completed", task_id);
                    true
                }
            }
        });

        if found {
            Ok(())
        } else {
            Err(TallyError::not_found("task", task_id))
        }
    }

    /// Records a failed attempt, deciding between a delayed retry and terminal failure.
    pub fn fail_task(&self, task_id: &TaskId, error: &TallyError) -> FailureOutcome {
        let max_retries = self.config.max_retries;
        self.tasks
            .update(task_id, |entry| {
                if entry.status.is_terminal() {
                    return FailureOutcome::Ignored;
                }

                entry.retry_count += 1;
                entry.last_error = Some(error.to_string());
                entry.lease_expires = None;
                entry.assigned_to = None;

                if error.is_transient() && entry.retry_count <= max_retries {
                    let delay_ms = self.backoff_delay(entry.retry_count);
                    entry.status = TaskStatus::Pending;
                    entry.not_before = now_ms() + delay_ms;
                    tracing::warn!(
                        "Task {} failed (attempt {}), retrying in {} ms: {}",
                        task_id,
                        entry.retry_count,
                        delay_ms,
                        error
                    );
                    FailureOutcome::Retrying {
                        attempt: entry.retry_count,
                        delay_ms,
                    }
                } else {
                    entry.status = TaskStatus::Failed {
                        error: error.to_string(),
                    };
                    self.failed_total.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Task {} failed permanently after {} attempt(s): {}",
                        task_id,
                        entry.retry_count,
                        error
                    );
                    FailureOutcome::Failed
                }
            })
            .unwrap_or(FailureOutcome::Ignored)
    }

    /// Operator override: marks a non-terminal task `Failed` to unblock a stuck job.
    pub fn abandon_task(&self, task_id: &TaskId, reason: &str) -> Result<Task> {
        self.tasks
            .update(task_id, |entry| {
                if entry.status.is_terminal() {
                    return Err(TallyError::InvalidState(format!(
                        "task {} is already {:?}",
                        task_id, entry.status
                    )));
                }
                entry.status = TaskStatus::Failed {
                    error: reason.to_string(),
                };
                entry.lease_expires = None;
                entry.last_error = Some(reason.to_string());
                self.failed_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Task {} abandoned by operator: {}", task_id, reason);
                Ok(entry.task.clone())
            })
            .unwrap_or_else(|| Err(TallyError::not_found("task", task_id)))
    }

    /// Deletes a `Failed` row once its failure hook has run. Live rows are kept.
    pub fn remove_failed(&self, task_id: &TaskId) -> bool {
        self.tasks.compute(task_id.clone(), |slot| {
            let failed = matches!(
                slot.as_ref().map(|entry| &entry.status),
                Some(TaskStatus::Failed { .. })
            );
            if failed {
                *slot = None;
            }
            failed
        })
    }

    /// Exponential backoff with jitter, capped at `backoff_max_ms`.
    fn backoff_delay(&self, attempt: u32) -> u64 {
        let base = self.config.backoff_base_ms;
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = base
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms);
        // Simple jitter to prevent thundering herd
        let jitter = rand::random::<u64>() % (base / 2 + 1);
        delay + jitter
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<TaskEntry> {
        self.tasks.get(task_id)
    }

    /// Live pending and running tasks, plus completed and failed totals since this queue was
    /// created.
    pub fn stats(&self) -> QueueStats {
        let live = self.tasks.fold(QueueStats::default(), |mut stats, _, entry| {
            match entry.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Failed { .. } => {}
            }
            stats
        });
        QueueStats {
            done: self.done_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            ..live
        }
    }

    /// True when no task is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.stats().outstanding() == 0
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn snapshot(&self) -> Vec<(TaskId, TaskEntry)> {
        self.tasks.dump()
    }

    pub fn restore(&self, entries: Vec<(TaskId, TaskEntry)>) {
        self.tasks.apply_entries(entries);
    }
}
