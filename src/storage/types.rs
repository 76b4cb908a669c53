//! Persisted Record Types
//!
//! Row definitions for the tables held by [`TallyStore`](super::store::TallyStore).
//! Identifiers are thin string wrappers so they serialize cleanly and cannot be mixed up.

use crate::engine::BallotTrackingProof;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(ElectionId);
string_id!(
    /// Opaque reference to a cast ballot's ciphertext.
    BallotId
);
string_id!(GuardianId);
string_id!(
    /// Deterministic `<election>#<ordinal>` identifier, so a chunk can be located from its
    /// election and position without a secondary index.
    ChunkId
);
string_id!(
    /// Identifies one tally job or one guardian decryption run.
    JobId
);

impl ChunkId {
    pub fn for_chunk(election_id: &ElectionId, ordinal: u64) -> Self {
        Self(format!("{}#{}", election_id.0, ordinal))
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA3-256 fingerprint of a guardian key share. Only the fingerprint is ever stored.
pub fn key_fingerprint(key_share: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"guardian-key-share");
    hasher.update(key_share);
    hasher.finalize().into()
}

/// A guardian as registered for an election.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guardian {
    pub id: GuardianId,
    pub sequence_order: u32,
    /// Fingerprint of the guardian's key share, used to validate submitted credentials.
    pub key_fingerprint: [u8; 32],
}

/// Guardian details supplied at election setup. The key share is fingerprinted and dropped.
#[derive(Debug, Clone)]
pub struct GuardianRegistration {
    pub id: GuardianId,
    pub sequence_order: u32,
    pub key_share: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ElectionSetup {
    pub election_id: ElectionId,
    pub candidates: Vec<String>,
    pub guardians: Vec<GuardianRegistration>,
    pub threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub id: ElectionId,
    pub candidates: Vec<String>,
    pub guardians: Vec<Guardian>,
    pub threshold: usize,
    /// Set once chunking starts. From then on the ballot set is frozen.
    pub chunk_count: Option<u64>,
    pub chunk_size: Option<usize>,
}

impl Election {
    pub fn guardian(&self, guardian_id: &GuardianId) -> Option<&Guardian> {
        self.guardians.iter().find(|g| &g.id == guardian_id)
    }

    pub fn guardian_ids(&self) -> Vec<GuardianId> {
        self.guardians.iter().map(|g| g.id.clone()).collect()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        (0..self.chunk_count.unwrap_or(0))
            .map(|ordinal| ChunkId::for_chunk(&self.id, ordinal))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub id: BallotId,
    pub election_id: ElectionId,
    pub ciphertext: Vec<u8>,
    pub chunk_id: Option<ChunkId>,
}

/// Per-chunk lifecycle. Moves forward only, except `Tallying -> Pending` after a failed
/// attempt and `TallyFailed -> Pending` on an explicit tally retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Tallying,
    Tallied,
    TallyFailed,
    Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub election_id: ElectionId,
    pub ordinal: u64,
    pub ballot_ids: Vec<BallotId>,
    pub encrypted_tally: Option<Vec<u8>>,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A guardian's direct share for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialDecryption {
    pub chunk_id: ChunkId,
    pub guardian_id: GuardianId,
    pub share: Vec<u8>,
    /// Decryption run that produced the row.
    pub run_id: JobId,
}

/// A present guardian's backup share standing in for a missing guardian on one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensatedDecryption {
    pub chunk_id: ChunkId,
    pub compensating_guardian_id: GuardianId,
    pub missing_guardian_id: GuardianId,
    pub backup_share: Vec<u8>,
    pub run_id: JobId,
}

/// Decrypted output of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkResult {
    pub chunk_id: ChunkId,
    pub ordinal: u64,
    pub counts: BTreeMap<String, u64>,
    pub tracking_proofs: Vec<BallotTrackingProof>,
    /// Guardians whose contributions were combined, sorted.
    pub contributors: Vec<GuardianId>,
}
