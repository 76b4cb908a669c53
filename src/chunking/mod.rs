//! Chunk Partitioner
//!
//! Splits an election's ballots into fixed-size chunks. Ballot indices are shuffled with a
//! Fisher–Yates pass driven by a cryptographically strong RNG before being sliced, so the
//! chunk a ballot lands in says nothing about when it was submitted. The final chunk may be
//! smaller than `chunk_size`.

use crate::error::{Result, TallyError};
use crate::storage::types::{BallotId, Chunk, ChunkId, ChunkStatus, ElectionId};

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng};

/// Output of partitioning: the chunk rows plus the ballot -> chunk assignment.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub assignments: Vec<(BallotId, ChunkId)>,
}

/// `ceil(ballot_count / chunk_size)`.
pub fn chunk_count(ballot_count: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    ballot_count.div_ceil(chunk_size)
}

pub fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(TallyError::Validation(
            "chunk_size must be greater than zero".into(),
        ));
    }
    Ok(())
}

/// Partitions ballots using the operating system's CSPRNG.
pub fn partition_ballots(
    election_id: &ElectionId,
    ballot_ids: &[BallotId],
    chunk_size: usize,
) -> Result<ChunkPlan> {
    partition_ballots_with_rng(election_id, ballot_ids, chunk_size, &mut OsRng)
}

pub fn partition_ballots_with_rng<R>(
    election_id: &ElectionId,
    ballot_ids: &[BallotId],
    chunk_size: usize,
    rng: &mut R,
) -> Result<ChunkPlan>
where
    R: Rng + CryptoRng + ?Sized,
{
    validate_chunk_size(chunk_size)?;

    let mut indices: Vec<usize> = (0..ballot_ids.len()).collect();
    // `shuffle` is an in-place Fisher–Yates.
    indices.shuffle(rng);

    let mut chunks = Vec::with_capacity(chunk_count(ballot_ids.len(), chunk_size));
    let mut assignments = Vec::with_capacity(ballot_ids.len());

    for (ordinal, group) in indices.chunks(chunk_size).enumerate() {
        let chunk_id = ChunkId::for_chunk(election_id, ordinal as u64);
        let members: Vec<BallotId> = group.iter().map(|&i| ballot_ids[i].clone()).collect();

        for ballot_id in &members {
            assignments.push((ballot_id.clone(), chunk_id.clone()));
        }

        chunks.push(Chunk {
            id: chunk_id,
            election_id: election_id.clone(),
            ordinal: ordinal as u64,
            ballot_ids: members,
            encrypted_tally: None,
            status: ChunkStatus::Pending,
            attempts: 0,
            last_error: None,
        });
    }

    tracing::debug!(
        "Partitioned {} ballots of election {} into {} chunks of up to {}",
        ballot_ids.len(),
        election_id,
        chunks.len(),
        chunk_size
    );

    Ok(ChunkPlan {
        chunks,
        assignments,
    })
}

#[cfg(test)]
mod tests;
