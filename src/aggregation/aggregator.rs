//! Result Aggregator
//!
//! Combines each chunk's decryption shares into plaintext counts and folds the chunk results
//! into election totals.
//!
//! ## Contributors
//! A guardian contributes to a chunk once its decryption run is `Completed` and the direct
//! share stored for the chunk belongs to that run. Every other guardian is treated as missing,
//! and a contributor must also hold a backup share from the same run for each missing guardian.
//! A chunk combines only when the contributors reach the election threshold; otherwise the
//! chunk stays `Tallied` and the combine runs again when the next guardian completes.

use super::types::*;
use crate::engine::{DecryptionShare, TallyEngine, call_with_timeout};
use crate::error::{Result, TallyError};
use crate::executor::{Task, TaskQueue};
use crate::progress::{DecryptionPhase, JobStatus, ProgressTracker};
use crate::storage::TallyStore;
use crate::storage::types::{
    Chunk, ChunkId, ChunkResult, ChunkStatus, Election, ElectionId, GuardianId, JobId,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct ResultAggregator {
    store: Arc<TallyStore>,
    progress: Arc<ProgressTracker>,
    queue: Arc<TaskQueue>,
    engine: Arc<dyn TallyEngine>,
    engine_timeout: Duration,
}

impl ResultAggregator {
    pub fn new(
        store: Arc<TallyStore>,
        progress: Arc<ProgressTracker>,
        queue: Arc<TaskQueue>,
        engine: Arc<dyn TallyEngine>,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            store,
            progress,
            queue,
            engine,
            engine_timeout,
        }
    }

    /// Publishes a `Combine` task for every tallied chunk not yet combined.
    pub fn schedule_combine(&self, election_id: &ElectionId) -> Result<usize> {
        let election = self.store.election(election_id)?;
        let tasks: Vec<Task> = self
            .store
            .chunks_for(&election)
            .into_iter()
            .filter(|chunk| chunk.status == ChunkStatus::Tallied)
            .map(|chunk| Task::Combine {
                election_id: election_id.clone(),
                chunk_id: chunk.id,
            })
            .collect();

        let published = self.queue.publish_all(tasks).len();
        tracing::info!(
            "Scheduled {} combine task(s) for election {}",
            published,
            election_id
        );
        Ok(published)
    }

    /// `combineElection`: explicit request to (re)try combination of every pending chunk.
    pub fn combine_election(&self, election_id: &ElectionId) -> Result<usize> {
        let tally_completed = self
            .progress
            .tally(election_id)
            .is_some_and(|tally| tally.status == JobStatus::Completed);
        if !tally_completed {
            // Surfaces NotFound for unknown elections before the state error.
            self.store.election(election_id)?;
            return Err(TallyError::InvalidState(format!(
                "tally for election {} is not completed",
                election_id
            )));
        }
        self.schedule_combine(election_id)
    }

    /// Contributing guardians with the run their shares must come from, and the guardians
    /// treated as missing.
    fn contributors(
        &self,
        election: &Election,
        chunk: &Chunk,
    ) -> (BTreeMap<GuardianId, JobId>, Vec<GuardianId>) {
        let mut contributors: BTreeMap<GuardianId, JobId> = election
            .guardians
            .iter()
            .filter_map(|g| {
                let run = self.progress.decryption(&election.id, &g.id)?;
                let share = self.store.partial(&chunk.id, &g.id)?;
                (run.phase == DecryptionPhase::Completed && share.run_id == run.run_id)
                    .then(|| (g.id.clone(), run.run_id))
            })
            .collect();

        // Dropping a contributor makes it missing too, so repeat until the set is stable.
        loop {
            let missing: Vec<GuardianId> = election
                .guardian_ids()
                .into_iter()
                .filter(|id| !contributors.contains_key(id))
                .collect();
            let before = contributors.len();
            contributors.retain(|present, run_id| {
                missing.iter().all(|absent| {
                    self.store
                        .compensated(&chunk.id, present, absent)
                        .is_some_and(|backup| &backup.run_id == run_id)
                })
            });

            if contributors.len() == before {
                return (contributors, missing);
            }
        }
    }

    /// Handler body for a `Combine` task.
    pub async fn combine_chunk(&self, election_id: &ElectionId, chunk_id: &ChunkId) -> Result<()> {
        let election = self.store.election(election_id)?;
        let chunk = self.store.chunk(chunk_id)?;

        match chunk.status {
            ChunkStatus::Combined => {
                tracing::debug!("Chunk {} already combined", chunk_id);
                return Ok(());
            }
            ChunkStatus::Tallied => {}
            other => {
                return Err(TallyError::InvalidState(format!(
                    "chunk {} is {:?}, not tallied",
                    chunk_id, other
                )));
            }
        }
        let Some(encrypted_tally) = chunk.encrypted_tally.as_deref() else {
            return Err(TallyError::InvalidState(format!(
                "chunk {} has no encrypted tally",
                chunk_id
            )));
        };

        let (contributors, missing) = self.contributors(&election, &chunk);
        if contributors.len() < election.threshold {
            return Err(TallyError::InsufficientContributors {
                chunk_id: chunk_id.clone(),
                available: contributors.len(),
                threshold: election.threshold,
            });
        }

        let mut shares = Vec::with_capacity(contributors.len() * (missing.len() + 1));
        for (guardian_id, run_id) in &contributors {
            if let Some(partial) = self.store.partial(chunk_id, guardian_id)
                && &partial.run_id == run_id
            {
                shares.push(DecryptionShare::Direct {
                    guardian_id: guardian_id.clone(),
                    share: partial.share,
                });
            }
        }
        for absent in &missing {
            for (present, run_id) in &contributors {
                if let Some(backup) = self.store.compensated(chunk_id, present, absent)
                    && &backup.run_id == run_id
                {
                    shares.push(DecryptionShare::Compensated {
                        compensating_guardian_id: present.clone(),
                        missing_guardian_id: absent.clone(),
                        share: backup.backup_share,
                    });
                }
            }
        }

        let combined = call_with_timeout(
            self.engine_timeout,
            "combine",
            self.engine.combine(encrypted_tally, &shares),
        )
        .await?;

        self.store.store_chunk_result(ChunkResult {
            chunk_id: chunk_id.clone(),
            ordinal: chunk.ordinal,
            counts: combined.counts,
            tracking_proofs: combined.tracking_proofs,
            contributors: contributors.keys().cloned().collect(),
        });
        self.store.update_chunk(chunk_id, |chunk| {
            if chunk.status == ChunkStatus::Tallied {
                chunk.status = ChunkStatus::Combined;
            }
        })?;

        tracing::info!(
            "Combined chunk {} with {} contributor(s), {} missing",
            chunk_id,
            contributors.len(),
            missing.len()
        );

        let status = self.election_decryption_status(election_id)?;
        if status.status == JobStatus::Completed {
            tracing::info!(
                "Election {} decryption completed ({} chunks)",
                election_id,
                status.total_chunks
            );
        }
        Ok(())
    }

    /// Failure hook for `Combine` tasks. The chunk stays `Tallied` and `combineElection`
    /// can schedule it again.
    pub fn on_combine_failed(&self, chunk_id: &ChunkId, error: &str) {
        tracing::error!("Combine for chunk {} failed: {}", chunk_id, error);
    }

    /// `getElectionDecryptionStatus`. `COMPLETED` only once every chunk is combined.
    pub fn election_decryption_status(
        &self,
        election_id: &ElectionId,
    ) -> Result<ElectionDecryptionStatus> {
        let election = self.store.election(election_id)?;
        let total_chunks = election.chunk_count.unwrap_or(0);
        let combined_chunks = self
            .store
            .chunks_for(&election)
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Combined)
            .count() as u64;

        let any_run_started = election.guardians.iter().any(|g| {
            self.progress
                .decryption(election_id, &g.id)
                .is_some_and(|run| run.phase != DecryptionPhase::Pending)
        });

        let status = if total_chunks > 0 && combined_chunks == total_chunks {
            JobStatus::Completed
        } else if combined_chunks > 0 || any_run_started {
            JobStatus::InProgress
        } else {
            JobStatus::Pending
        };

        Ok(ElectionDecryptionStatus {
            status,
            combined_chunks,
            total_chunks,
            pending_chunks: total_chunks - combined_chunks,
        })
    }

    /// `getAggregatedResult`. Available only when every chunk has been combined.
    pub fn aggregated_result(&self, election_id: &ElectionId) -> Result<AggregatedResult> {
        let election = self.store.election(election_id)?;
        let total = election.chunk_count.unwrap_or(0);

        let mut chunks = self.store.chunks_for(&election);
        chunks.sort_by_key(|chunk| chunk.ordinal);
        let results: Vec<ChunkResult> = chunks
            .iter()
            .filter_map(|chunk| self.store.chunk_result(&chunk.id))
            .collect();

        if total == 0 || (results.len() as u64) < total {
            return Err(TallyError::ResultsNotReady {
                combined: results.len() as u64,
                total,
            });
        }

        let mut final_counts: BTreeMap<String, u64> = election
            .candidates
            .iter()
            .map(|candidate| (candidate.clone(), 0))
            .collect();
        for result in &results {
            for (candidate, count) in &result.counts {
                *final_counts.entry(candidate.clone()).or_insert(0) += count;
            }
        }

        let ballot_chunk_assignments = chunks
            .iter()
            .flat_map(|chunk| {
                chunk.ballot_ids.iter().map(|ballot_id| BallotAssignment {
                    ballot_id: ballot_id.clone(),
                    chunk_id: chunk.id.clone(),
                    ordinal: chunk.ordinal,
                })
            })
            .collect();

        Ok(AggregatedResult {
            election_id: election_id.clone(),
            per_chunk_results: results,
            final_counts,
            ballot_chunk_assignments,
        })
    }
}
