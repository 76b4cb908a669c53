//! Progress Record Types
//!
//! One [`TallyProgress`] row per election and one [`DecryptionProgress`] row per
//! (election, guardian). Totals are fixed when the row is created; processed counters only
//! ever move by atomic increments, and each unit of work (a chunk, or a chunk and missing
//! guardian pair) is counted at most once.

use crate::storage::types::{ElectionId, GuardianId, JobId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Set of unit indices a counter has already absorbed, one bit per unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountedUnits(Vec<u64>);

impl CountedUnits {
    /// Marks `unit` as counted. Returns `false` if it already was.
    pub fn insert(&mut self, unit: u64) -> bool {
        let (word, bit) = ((unit / 64) as usize, unit % 64);
        if self.0.len() <= word {
            self.0.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.0[word] & mask == 0;
        self.0[word] |= mask;
        fresh
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallyProgress {
    pub election_id: ElectionId,
    pub job_id: JobId,
    pub status: JobStatus,
    pub processed_chunks: u64,
    pub failed_chunks: u64,
    pub total_chunks: u64,
    pub error_message: Option<String>,
    pub updated_at: u64,
    /// Chunk ordinals already counted in `processed_chunks`.
    pub counted: CountedUnits,
}

/// Phase of a guardian's decryption run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DecryptionPhase {
    Pending,
    /// Phase 1: one direct share per chunk.
    PartialDecryption,
    /// Phase 2: one backup share per (chunk, other guardian).
    CompensatedShares,
    Completed,
    Failed,
}

impl DecryptionPhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DecryptionPhase::PartialDecryption | DecryptionPhase::CompensatedShares
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecryptionProgress {
    pub election_id: ElectionId,
    pub guardian_id: GuardianId,
    pub run_id: JobId,
    pub phase: DecryptionPhase,
    pub processed_chunks: u64,
    pub total_chunks: u64,
    /// Guardian most recently covered by a backup share.
    pub compensating_for: Option<GuardianId>,
    pub processed_compensated: u64,
    pub total_compensated: u64,
    pub error_message: Option<String>,
    pub updated_at: u64,
    pub counted_chunks: CountedUnits,
    /// Indexed by `ordinal * (guardians - 1) + position of the missing guardian`.
    pub counted_compensated: CountedUnits,
}

/// Result of asking to start (or restart) the tally job for an election.
#[derive(Debug, Clone, PartialEq)]
pub enum TallyInit {
    /// No job existed; a fresh record was created.
    Created(TallyProgress),
    /// A job is pending, running or complete; the caller gets it unchanged.
    Existing(TallyProgress),
    /// The previous job had failed; its failure was cleared for a retry.
    Retrying(TallyProgress),
}

/// Result of the compare-and-set that guards guardian decryption runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptionBegin {
    /// Absent or pending -> in progress.
    Started(DecryptionProgress),
    /// Failed -> fresh run with a new run id.
    Restarted(DecryptionProgress),
    /// A run is already in flight.
    Attached(DecryptionProgress),
    AlreadyCompleted(DecryptionProgress),
}

/// What `getTallyStatus` returns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TallyStatusView {
    pub status: JobStatus,
    pub processed_chunks: u64,
    pub total_chunks: u64,
    pub failed_chunks: u64,
    pub error_message: Option<String>,
}

impl From<&TallyProgress> for TallyStatusView {
    fn from(progress: &TallyProgress) -> Self {
        Self {
            status: progress.status,
            processed_chunks: progress.processed_chunks,
            total_chunks: progress.total_chunks,
            failed_chunks: progress.failed_chunks,
            error_message: progress.error_message.clone(),
        }
    }
}

/// What `getDecryptionStatus` returns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecryptionStatusView {
    pub phase: DecryptionPhase,
    pub processed_chunks: u64,
    pub total_chunks: u64,
    pub compensating_for_guardian_id: Option<GuardianId>,
    pub processed_compensated: u64,
    pub total_compensated: u64,
    pub error_message: Option<String>,
}

impl From<&DecryptionProgress> for DecryptionStatusView {
    fn from(progress: &DecryptionProgress) -> Self {
        Self {
            phase: progress.phase,
            processed_chunks: progress.processed_chunks,
            total_chunks: progress.total_chunks,
            compensating_for_guardian_id: progress.compensating_for.clone(),
            processed_compensated: progress.processed_compensated,
            total_compensated: progress.total_compensated,
            error_message: progress.error_message.clone(),
        }
    }
}
