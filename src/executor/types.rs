use crate::storage::types::{ChunkId, ElectionId, GuardianId, JobId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a task in the queue.
///
/// Wrapper around a UUID string. This ID is hashed to determine the queue partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents the lifecycle state of a task in the queue. A task that succeeds leaves the
/// queue, so there is no `Done` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly not before `TaskEntry::not_before`).
    Pending,
    /// Claimed by a worker. Accompanied by a `lease_expires` timestamp in `TaskEntry`.
    InProgress,
    /// Terminal failure: retries exhausted, a non-retryable error, or operator intervention.
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }
}

/// Discriminant of [`Task`], used to route tasks to handlers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Tally,
    PartialDecrypt,
    CompensatedDecrypt,
    Combine,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Tally => "tally",
            TaskKind::PartialDecrypt => "partial_decrypt",
            TaskKind::CompensatedDecrypt => "compensated_decrypt",
            TaskKind::Combine => "combine",
        };
        f.write_str(name)
    }
}

/// The definition of a unit of work. Every variant targets exactly one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Task {
    /// Homomorphically tally one chunk's ballots.
    Tally {
        election_id: ElectionId,
        chunk_id: ChunkId,
    },
    /// Compute `guardian_id`'s direct share for one chunk within decryption run `run_id`.
    PartialDecrypt {
        election_id: ElectionId,
        chunk_id: ChunkId,
        guardian_id: GuardianId,
        run_id: JobId,
    },
    /// Compute `guardian_id`'s backup share for `missing_guardian_id` on one chunk.
    CompensatedDecrypt {
        election_id: ElectionId,
        chunk_id: ChunkId,
        guardian_id: GuardianId,
        missing_guardian_id: GuardianId,
        run_id: JobId,
    },
    /// Combine the available shares of one chunk into its plaintext result.
    Combine {
        election_id: ElectionId,
        chunk_id: ChunkId,
    },
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Tally { .. } => TaskKind::Tally,
            Task::PartialDecrypt { .. } => TaskKind::PartialDecrypt,
            Task::CompensatedDecrypt { .. } => TaskKind::CompensatedDecrypt,
            Task::Combine { .. } => TaskKind::Combine,
        }
    }

    pub fn election_id(&self) -> &ElectionId {
        match self {
            Task::Tally { election_id, .. }
            | Task::PartialDecrypt { election_id, .. }
            | Task::CompensatedDecrypt { election_id, .. }
            | Task::Combine { election_id, .. } => election_id,
        }
    }

    pub fn chunk_id(&self) -> &ChunkId {
        match self {
            Task::Tally { chunk_id, .. }
            | Task::PartialDecrypt { chunk_id, .. }
            | Task::CompensatedDecrypt { chunk_id, .. }
            | Task::Combine { chunk_id, .. } => chunk_id,
        }
    }
}

/// The queue's stored row for a task: definition plus execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task: Task,
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Worker currently holding the lease (if InProgress).
    pub assigned_to: Option<String>,
    /// Timestamp (ms) when the task was published.
    pub created_at: u64,
    /// Timestamp (ms) when the current lease expires.
    /// If `now > lease_expires`, the holder is considered dead and the task can be reclaimed.
    pub lease_expires: Option<u64>,
    /// Earliest time (ms) the task may be claimed; pushed forward by retry backoff.
    pub not_before: u64,
    pub last_error: Option<String>,
}

impl TaskEntry {
    pub fn new(task: Task) -> Self {
        let now = now_ms();
        Self {
            task,
            status: TaskStatus::Pending,
            retry_count: 0,
            assigned_to: None,
            created_at: now,
            lease_expires: None,
            not_before: now,
            last_error: None,
        }
    }

    /// Whether a worker may claim this task at `now`.
    pub fn is_claimable(&self, now: u64) -> bool {
        match self.status {
            TaskStatus::Pending => self.not_before <= now,
            TaskStatus::InProgress => self.lease_expires.map(|lease| now > lease).unwrap_or(false),
            _ => false,
        }
    }
}

/// What the queue decided after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Requeued; claimable again after `delay_ms`.
    Retrying { attempt: u32, delay_ms: u64 },
    /// Terminal. The task kind's failure hook must run.
    Failed,
    /// The task was already terminal or unknown; nothing changed.
    Ignored,
}

/// Live task counts, plus running totals of finished tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    /// Tasks acknowledged since the queue was created.
    pub done: usize,
    /// Tasks that failed terminally since the queue was created.
    pub failed: usize,
}

impl QueueStats {
    /// Tasks that still need a worker.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_progress
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
