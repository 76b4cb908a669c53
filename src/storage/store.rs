//! Tally Store
//!
//! The persisted state of the pipeline: elections, ballots, chunks, decryption shares and
//! per-chunk results. Each table is a [`PartitionedMap`]; cross-table invariants (the frozen
//! ballot set, one share row per run) are enforced with compare-and-set updates on the owning
//! row rather than with process-local locks.

use super::memory::PartitionedMap;
use super::types::*;
use crate::chunking::ChunkPlan;
use crate::engine::BallotCiphertext;
use crate::error::{Result, TallyError};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

type ShareKey = (ChunkId, GuardianId);
type BackupKey = (ChunkId, GuardianId, GuardianId);
type VaultKey = (ElectionId, GuardianId);

pub struct TallyStore {
    elections: PartitionedMap<ElectionId, Election>,
    /// Ballot ids per election, in submission order.
    election_ballots: PartitionedMap<ElectionId, Vec<BallotId>>,
    ballots: PartitionedMap<BallotId, Ballot>,
    chunks: PartitionedMap<ChunkId, Chunk>,
    partials: PartitionedMap<ShareKey, PartialDecryption>,
    /// Keyed by (chunk, compensating guardian, missing guardian).
    compensated: PartitionedMap<BackupKey, CompensatedDecryption>,
    chunk_results: PartitionedMap<ChunkId, ChunkResult>,
    /// Guardian key shares for active decryption runs. Never snapshotted.
    key_vault: PartitionedMap<VaultKey, Vec<u8>>,
}

/// Serializable copy of every durable table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub elections: Vec<(ElectionId, Election)>,
    pub election_ballots: Vec<(ElectionId, Vec<BallotId>)>,
    pub ballots: Vec<(BallotId, Ballot)>,
    pub chunks: Vec<(ChunkId, Chunk)>,
    pub partials: Vec<(ShareKey, PartialDecryption)>,
    pub compensated: Vec<(BackupKey, CompensatedDecryption)>,
    pub chunk_results: Vec<(ChunkId, ChunkResult)>,
}

impl TallyStore {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            elections: PartitionedMap::new(num_partitions),
            election_ballots: PartitionedMap::new(num_partitions),
            ballots: PartitionedMap::new(num_partitions),
            chunks: PartitionedMap::new(num_partitions),
            partials: PartitionedMap::new(num_partitions),
            compensated: PartitionedMap::new(num_partitions),
            chunk_results: PartitionedMap::new(num_partitions),
            key_vault: PartitionedMap::new(num_partitions),
        }
    }

    // --- Elections & ballots ---

    pub fn register_election(&self, setup: ElectionSetup) -> Result<()> {
        if setup.candidates.is_empty() {
            return Err(TallyError::Validation(
                "an election needs at least one candidate".into(),
            ));
        }
        if setup.guardians.is_empty() {
            return Err(TallyError::Validation(
                "an election needs at least one guardian".into(),
            ));
        }
        if setup.threshold == 0 || setup.threshold > setup.guardians.len() {
            return Err(TallyError::Validation(format!(
                "threshold must be between 1 and {} (guardian count), got {}",
                setup.guardians.len(),
                setup.threshold
            )));
        }

        let mut ids = HashSet::new();
        let mut orders = HashSet::new();
        for guardian in &setup.guardians {
            if !ids.insert(&guardian.id) {
                return Err(TallyError::Validation(format!(
                    "duplicate guardian id {}",
                    guardian.id
                )));
            }
            if !orders.insert(guardian.sequence_order) {
                return Err(TallyError::Validation(format!(
                    "duplicate guardian sequence order {}",
                    guardian.sequence_order
                )));
            }
        }

        let election = Election {
            id: setup.election_id.clone(),
            candidates: setup.candidates,
            guardians: setup
                .guardians
                .iter()
                .map(|g| Guardian {
                    id: g.id.clone(),
                    sequence_order: g.sequence_order,
                    key_fingerprint: key_fingerprint(&g.key_share),
                })
                .collect(),
            threshold: setup.threshold,
            chunk_count: None,
            chunk_size: None,
        };

        if !self
            .elections
            .insert_if_absent(setup.election_id.clone(), election)
        {
            return Err(TallyError::Validation(format!(
                "election {} already registered",
                setup.election_id
            )));
        }
        self.election_ballots
            .insert(setup.election_id.clone(), Vec::new());

        tracing::info!(
            "Registered election {} ({} guardians, threshold {})",
            setup.election_id,
            setup.guardians.len(),
            setup.threshold
        );
        Ok(())
    }

    pub fn election(&self, election_id: &ElectionId) -> Result<Election> {
        self.elections
            .get(election_id)
            .ok_or_else(|| TallyError::not_found("election", election_id))
    }

    /// Adds a ballot to an election whose chunk set has not been frozen yet.
    pub fn add_ballot(
        &self,
        election_id: &ElectionId,
        ballot_id: BallotId,
        ciphertext: Vec<u8>,
    ) -> Result<()> {
        // The frozen check and the append happen under the election row's lock, so a ballot
        // can never slip in after `freeze_chunks` has read the ballot list.
        self.elections
            .update(election_id, |election| {
                if election.chunk_count.is_some() {
                    return Err(TallyError::Validation(format!(
                        "election {} is already chunked; ballot set is frozen",
                        election_id
                    )));
                }
                let ballot = Ballot {
                    id: ballot_id.clone(),
                    election_id: election_id.clone(),
                    ciphertext,
                    chunk_id: None,
                };
                if !self.ballots.insert_if_absent(ballot_id.clone(), ballot) {
                    return Err(TallyError::Validation(format!(
                        "ballot {} already exists",
                        ballot_id
                    )));
                }
                self.election_ballots
                    .update(election_id, |ids| ids.push(ballot_id.clone()));
                Ok(())
            })
            .unwrap_or_else(|| Err(TallyError::not_found("election", election_id)))
    }

    pub fn election_ballot_ids(&self, election_id: &ElectionId) -> Vec<BallotId> {
        self.election_ballots.get(election_id).unwrap_or_default()
    }

    pub fn ballot(&self, ballot_id: &BallotId) -> Option<Ballot> {
        self.ballots.get(ballot_id)
    }

    // --- Chunks ---

    /// Freezes the election's ballot set and persists the chunk plan.
    ///
    /// Returns `Ok(false)` without writing anything if the election was already chunked;
    /// chunk membership is written once. Fails if ballots were added after the plan was made.
    /// Chunk rows are written while the election row is locked, so `chunk_count` never
    /// becomes visible before the chunks it counts.
    pub fn freeze_chunks(
        &self,
        election_id: &ElectionId,
        chunk_size: usize,
        plan: ChunkPlan,
    ) -> Result<bool> {
        let chunk_count = plan.chunks.len() as u64;
        let frozen = self
            .elections
            .update(election_id, |election| {
                if election.chunk_count.is_some() {
                    return Ok(false);
                }
                let current = self
                    .election_ballots
                    .get(election_id)
                    .map(|ids| ids.len())
                    .unwrap_or(0);
                if current != plan.assignments.len() {
                    return Err(TallyError::InvalidState(format!(
                        "ballot set of election {} changed while chunking ({} planned, {} present)",
                        election_id,
                        plan.assignments.len(),
                        current
                    )));
                }

                for (ballot_id, chunk_id) in plan.assignments {
                    self.ballots
                        .update(&ballot_id, |ballot| ballot.chunk_id = Some(chunk_id));
                }
                for chunk in plan.chunks {
                    self.chunks.insert(chunk.id.clone(), chunk);
                }
                election.chunk_count = Some(chunk_count);
                election.chunk_size = Some(chunk_size);
                Ok(true)
            })
            .unwrap_or_else(|| Err(TallyError::not_found("election", election_id)))?;

        if frozen {
            tracing::info!(
                "Froze election {} into {} chunk(s) of up to {} ballots",
                election_id,
                chunk_count,
                chunk_size
            );
        }
        Ok(frozen)
    }

    pub fn chunk(&self, chunk_id: &ChunkId) -> Result<Chunk> {
        self.chunks
            .get(chunk_id)
            .ok_or_else(|| TallyError::not_found("chunk", chunk_id))
    }

    pub fn update_chunk<R>(&self, chunk_id: &ChunkId, f: impl FnOnce(&mut Chunk) -> R) -> Result<R> {
        self.chunks
            .update(chunk_id, f)
            .ok_or_else(|| TallyError::not_found("chunk", chunk_id))
    }

    pub fn chunks_for(&self, election: &Election) -> Vec<Chunk> {
        election
            .chunk_ids()
            .iter()
            .filter_map(|id| self.chunks.get(id))
            .collect()
    }

    /// Loads only the ciphertexts of one chunk's ballots.
    pub fn chunk_ciphertexts(&self, chunk: &Chunk) -> Result<Vec<BallotCiphertext>> {
        chunk
            .ballot_ids
            .iter()
            .map(|ballot_id| {
                self.ballots
                    .get(ballot_id)
                    .map(|ballot| BallotCiphertext {
                        ballot_id: ballot.id,
                        ciphertext: ballot.ciphertext,
                    })
                    .ok_or_else(|| TallyError::not_found("ballot", ballot_id))
            })
            .collect()
    }

    // --- Decryption shares ---

    /// Writes a partial decryption unless this run already wrote one for the same chunk.
    ///
    /// A row left by another run is replaced only while `is_active(&share.run_id)` holds, so a
    /// task of a superseded run can never overwrite the current run's share. Returns `true`
    /// when the row holds this run's share after the call.
    pub fn record_partial(
        &self,
        share: PartialDecryption,
        is_active: impl FnOnce(&JobId) -> bool,
    ) -> bool {
        let key = (share.chunk_id.clone(), share.guardian_id.clone());
        self.partials.compute(key, |slot| match slot {
            Some(existing) if existing.run_id == share.run_id => true,
            _ if is_active(&share.run_id) => {
                *slot = Some(share);
                true
            }
            _ => false,
        })
    }

    pub fn partial(&self, chunk_id: &ChunkId, guardian_id: &GuardianId) -> Option<PartialDecryption> {
        self.partials
            .get(&(chunk_id.clone(), guardian_id.clone()))
    }

    /// Same contract as [`record_partial`](Self::record_partial) for backup shares.
    pub fn record_compensated(
        &self,
        share: CompensatedDecryption,
        is_active: impl FnOnce(&JobId) -> bool,
    ) -> bool {
        let key = (
            share.chunk_id.clone(),
            share.compensating_guardian_id.clone(),
            share.missing_guardian_id.clone(),
        );
        self.compensated.compute(key, |slot| match slot {
            Some(existing) if existing.run_id == share.run_id => true,
            _ if is_active(&share.run_id) => {
                *slot = Some(share);
                true
            }
            _ => false,
        })
    }

    pub fn compensated(
        &self,
        chunk_id: &ChunkId,
        compensating: &GuardianId,
        missing: &GuardianId,
    ) -> Option<CompensatedDecryption> {
        self.compensated
            .get(&(chunk_id.clone(), compensating.clone(), missing.clone()))
    }

    /// Drops every share a guardian produced for an election, ahead of a fresh run.
    pub fn clear_guardian_artifacts(&self, election: &Election, guardian_id: &GuardianId) -> usize {
        let mut removed = 0;
        for chunk_id in election.chunk_ids() {
            if self
                .partials
                .remove(&(chunk_id.clone(), guardian_id.clone()))
                .is_some()
            {
                removed += 1;
            }
            for other in &election.guardians {
                if self
                    .compensated
                    .remove(&(chunk_id.clone(), guardian_id.clone(), other.id.clone()))
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        removed
    }

    // --- Results ---

    pub fn store_chunk_result(&self, result: ChunkResult) {
        self.chunk_results.insert(result.chunk_id.clone(), result);
    }

    pub fn chunk_result(&self, chunk_id: &ChunkId) -> Option<ChunkResult> {
        self.chunk_results.get(chunk_id)
    }

    // --- Key vault ---

    pub fn put_key_share(&self, election_id: &ElectionId, guardian_id: &GuardianId, key: Vec<u8>) {
        self.key_vault
            .insert((election_id.clone(), guardian_id.clone()), key);
    }

    pub fn key_share(&self, election_id: &ElectionId, guardian_id: &GuardianId) -> Option<Vec<u8>> {
        self.key_vault
            .get(&(election_id.clone(), guardian_id.clone()))
    }

    pub fn drop_key_share(&self, election_id: &ElectionId, guardian_id: &GuardianId) {
        self.key_vault
            .remove(&(election_id.clone(), guardian_id.clone()));
    }

    // --- Snapshot ---

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            elections: self.elections.dump(),
            election_ballots: self.election_ballots.dump(),
            ballots: self.ballots.dump(),
            chunks: self.chunks.dump(),
            partials: self.partials.dump(),
            compensated: self.compensated.dump(),
            chunk_results: self.chunk_results.dump(),
        }
    }

    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.elections.apply_entries(snapshot.elections);
        self.election_ballots.apply_entries(snapshot.election_ballots);
        self.ballots.apply_entries(snapshot.ballots);
        self.chunks.apply_entries(snapshot.chunks);
        self.partials.apply_entries(snapshot.partials);
        self.compensated.apply_entries(snapshot.compensated);
        self.chunk_results.apply_entries(snapshot.chunk_results);
    }
}
