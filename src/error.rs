//! Error Taxonomy
//!
//! Every fallible operation in the library returns [`TallyError`]. The variants map onto the
//! four behaviours callers care about:
//!
//! - **Validation** (`Validation`, `NotFound`, `InvalidState`): rejected before any task is
//!   enqueued, no side effects. `InvalidCredential` is reported the same way a completed run
//!   is, as the reason of a rejected decryption decision.
//! - **Transient** (`Transient`): engine timeout or unavailability. The task queue retries
//!   these with backoff.
//! - **Permanent** (`Permanent`): terminal for the task that hit it, recorded in the progress
//!   tables without affecting sibling chunks.
//! - **Waiting** (`InsufficientContributors`): a chunk cannot combine yet. The combine handler
//!   acknowledges it and the chunk is retried when another guardian completes.
//! - **Read-side** (`ResultsNotReady`, `Storage`).

use crate::storage::types::{ChunkId, GuardianId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TallyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid credential for guardian {0}")]
    InvalidCredential(GuardianId),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transient engine failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("chunk {chunk_id} has {available} contributing guardians, {threshold} required")]
    InsufficientContributors {
        chunk_id: ChunkId,
        available: usize,
        threshold: usize,
    },

    #[error("results not ready: {combined}/{total} chunks combined")]
    ResultsNotReady { combined: u64, total: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl TallyError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        TallyError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the task queue should requeue the task that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, TallyError::Transient(_))
    }
}

impl From<std::io::Error> for TallyError {
    fn from(e: std::io::Error) -> Self {
        TallyError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for TallyError {
    fn from(e: bincode::Error) -> Self {
        TallyError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(TallyError::Transient("timeout".into()).is_transient());
        assert!(!TallyError::Permanent("bad ciphertext".into()).is_transient());
        assert!(!TallyError::Validation("chunk_size".into()).is_transient());
        assert!(
            !TallyError::InsufficientContributors {
                chunk_id: ChunkId("e1#0".into()),
                available: 1,
                threshold: 2,
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = TallyError::not_found("election", "e-42");
        assert_eq!(err.to_string(), "election not found: e-42");

        let err = TallyError::ResultsNotReady {
            combined: 2,
            total: 3,
        };
        assert!(err.to_string().contains("2/3"));
    }
}
