use crate::progress::JobStatus;
use crate::storage::types::{BallotId, ChunkId, ChunkResult, ElectionId};

use serde::Serialize;
use std::collections::BTreeMap;

/// Audit link from a ballot to the chunk (and therefore the chunk result) that counted it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BallotAssignment {
    pub ballot_id: BallotId,
    pub chunk_id: ChunkId,
    pub ordinal: u64,
}

/// What `getAggregatedResult` returns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregatedResult {
    pub election_id: ElectionId,
    /// Ordered by chunk ordinal.
    pub per_chunk_results: Vec<ChunkResult>,
    /// Sum of every chunk's counts. Every registered candidate appears, possibly with 0.
    pub final_counts: BTreeMap<String, u64>,
    pub ballot_chunk_assignments: Vec<BallotAssignment>,
}

/// Election-wide view of chunk combination.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ElectionDecryptionStatus {
    pub status: JobStatus,
    pub combined_chunks: u64,
    pub total_chunks: u64,
    pub pending_chunks: u64,
}
