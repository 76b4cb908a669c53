//! Decryption Orchestrator
//!
//! Runs a guardian's two-phase decryption over every chunk of an election.
//!
//! ## Phases
//! 1. **Partial decryption**: one `PartialDecrypt` task per chunk. Total = chunk count.
//! 2. **Compensated shares**: once phase 1 reaches its total, one `CompensatedDecrypt` task per
//!    (chunk, other guardian). Total = chunk count x (guardian count - 1).
//!
//! When a run completes, the guardian's key share leaves the vault and `Combine` tasks are
//! scheduled for every chunk not yet combined.
//!
//! ## Run identity
//! Every run has a `run_id` carried by its tasks. A task whose run is no longer the active one
//! (because the run failed and was restarted) does nothing.

use super::types::DecryptionDecision;
use crate::aggregation::ResultAggregator;
use crate::engine::{TallyEngine, call_with_timeout};
use crate::error::{Result, TallyError};
use crate::executor::{Task, TaskQueue};
use crate::progress::{
    DecryptionBegin, DecryptionPhase, DecryptionProgress, DecryptionStatusView, JobStatus,
    ProgressTracker,
};
use crate::storage::TallyStore;
use crate::storage::types::{
    ChunkId, CompensatedDecryption, Election, ElectionId, GuardianId, JobId, PartialDecryption,
    key_fingerprint,
};

use std::sync::Arc;
use std::time::Duration;

pub struct DecryptionOrchestrator {
    store: Arc<TallyStore>,
    progress: Arc<ProgressTracker>,
    queue: Arc<TaskQueue>,
    engine: Arc<dyn TallyEngine>,
    aggregator: Arc<ResultAggregator>,
    engine_timeout: Duration,
}

impl DecryptionOrchestrator {
    pub fn new(
        store: Arc<TallyStore>,
        progress: Arc<ProgressTracker>,
        queue: Arc<TaskQueue>,
        engine: Arc<dyn TallyEngine>,
        aggregator: Arc<ResultAggregator>,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            store,
            progress,
            queue,
            engine,
            aggregator,
            engine_timeout,
        }
    }

    /// `initiateDecryption`.
    ///
    /// The credential is checked against the guardian's stored fingerprint before anything is
    /// scheduled; a mismatch is rejected. A run already in flight is attached to, a completed
    /// run is rejected and a failed run is discarded and started afresh. Unknown elections or
    /// guardians and an unfinished tally are errors.
    pub fn initiate_decryption(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        credential: &[u8],
    ) -> Result<DecryptionDecision> {
        let election = self.store.election(election_id)?;
        let guardian = election
            .guardian(guardian_id)
            .ok_or_else(|| TallyError::not_found("guardian", guardian_id))?;

        if key_fingerprint(credential) != guardian.key_fingerprint {
            tracing::warn!(
                "Rejected decryption credential for guardian {} in election {}",
                guardian_id,
                election_id
            );
            return Ok(DecryptionDecision::Rejected {
                reason: TallyError::InvalidCredential(guardian_id.clone()).to_string(),
            });
        }

        let tally_completed = self
            .progress
            .tally(election_id)
            .is_some_and(|tally| tally.status == JobStatus::Completed);
        if !tally_completed {
            return Err(TallyError::InvalidState(format!(
                "tally for election {} is not completed",
                election_id
            )));
        }

        let (total_chunks, total_compensated) = Self::totals(&election);
        match self.progress.try_begin_decryption(
            election_id,
            guardian_id,
            total_chunks,
            total_compensated,
        ) {
            DecryptionBegin::Started(run) => Ok(self.schedule_run(&election, credential, run)),
            DecryptionBegin::Restarted(run) => {
                let cleared = self.store.clear_guardian_artifacts(&election, guardian_id);
                tracing::info!(
                    "Restarting decryption for guardian {} in election {} (discarded {} share(s))",
                    guardian_id,
                    election_id,
                    cleared
                );
                Ok(self.schedule_run(&election, credential, run))
            }
            DecryptionBegin::Attached(run) => {
                // Refresh the vault so a run interrupted by a restart can resume.
                self.store
                    .put_key_share(election_id, guardian_id, credential.to_vec());
                tracing::debug!(
                    "Guardian {} attached to in-flight run {}",
                    guardian_id,
                    run.run_id
                );
                Ok(DecryptionDecision::Attached {
                    status: DecryptionStatusView::from(&run),
                })
            }
            DecryptionBegin::AlreadyCompleted(_) => Ok(DecryptionDecision::Rejected {
                reason: format!(
                    "guardian {} has already completed decryption for election {}",
                    guardian_id, election_id
                ),
            }),
        }
    }

    fn totals(election: &Election) -> (u64, u64) {
        let chunks = election.chunk_count.unwrap_or(0);
        let others = election.guardians.len().saturating_sub(1) as u64;
        (chunks, chunks * others)
    }

    fn schedule_run(
        &self,
        election: &Election,
        credential: &[u8],
        run: DecryptionProgress,
    ) -> DecryptionDecision {
        self.store
            .put_key_share(&election.id, &run.guardian_id, credential.to_vec());

        let tasks = election.chunk_ids().into_iter().map(|chunk_id| Task::PartialDecrypt {
            election_id: election.id.clone(),
            chunk_id,
            guardian_id: run.guardian_id.clone(),
            run_id: run.run_id.clone(),
        });
        let published = self.queue.publish_all(tasks).len();

        tracing::info!(
            "Decryption run {} for guardian {} in election {}: {} partial task(s)",
            run.run_id,
            run.guardian_id,
            election.id,
            published
        );

        DecryptionDecision::Accepted {
            run_id: run.run_id.clone(),
            status: DecryptionStatusView::from(&run),
        }
    }

    /// Returns the key share if `run_id` is still the guardian's active run in `phase`.
    fn active_key(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
        phase: DecryptionPhase,
    ) -> Result<Option<Vec<u8>>> {
        let active = self
            .progress
            .decryption(election_id, guardian_id)
            .is_some_and(|run| &run.run_id == run_id && run.phase == phase);
        if !active {
            tracing::debug!(
                "Skipping task of inactive run {} for guardian {}",
                run_id,
                guardian_id
            );
            return Ok(None);
        }

        self.store
            .key_share(election_id, guardian_id)
            .map(Some)
            .ok_or_else(|| {
                TallyError::Permanent(format!(
                    "no key share held for guardian {}; resubmit credentials",
                    guardian_id
                ))
            })
    }

    /// Loads the chunk's ordinal and encrypted tally blob.
    fn tallied_chunk(&self, chunk_id: &ChunkId) -> Result<(u64, Vec<u8>)> {
        let chunk = self.store.chunk(chunk_id)?;
        let encrypted_tally = chunk.encrypted_tally.ok_or_else(|| {
            TallyError::InvalidState(format!("chunk {} has no encrypted tally", chunk_id))
        })?;
        Ok((chunk.ordinal, encrypted_tally))
    }

    /// Handler body for a `PartialDecrypt` task.
    ///
    /// A share this run already wrote is not recomputed, but it is still reported to the run
    /// record. Counting is per chunk, so a redelivered task recovers a count lost between the
    /// share write and the increment without ever counting a chunk twice.
    pub async fn process_partial(
        &self,
        election_id: &ElectionId,
        chunk_id: &ChunkId,
        guardian_id: &GuardianId,
        run_id: &JobId,
    ) -> Result<()> {
        let Some(key) = self.active_key(
            election_id,
            guardian_id,
            run_id,
            DecryptionPhase::PartialDecryption,
        )?
        else {
            return Ok(());
        };

        let (ordinal, encrypted_tally) = self.tallied_chunk(chunk_id)?;
        let written = self
            .store
            .partial(chunk_id, guardian_id)
            .is_some_and(|share| &share.run_id == run_id);
        if written {
            tracing::debug!("Partial share for chunk {} already recorded", chunk_id);
        } else {
            let share = call_with_timeout(
                self.engine_timeout,
                "partial_decrypt",
                self.engine.partial_decrypt(&encrypted_tally, &key),
            )
            .await?;

            let stored = self.store.record_partial(
                PartialDecryption {
                    chunk_id: chunk_id.clone(),
                    guardian_id: guardian_id.clone(),
                    share,
                    run_id: run_id.clone(),
                },
                |run| self.progress.is_active_run(election_id, guardian_id, run),
            );
            if !stored {
                tracing::debug!("Run {} was superseded; dropping its share", run_id);
                return Ok(());
            }
        }

        let Some(run) = self
            .progress
            .record_partial_done(election_id, guardian_id, run_id, ordinal)
        else {
            return Ok(());
        };

        if run.processed_chunks == run.total_chunks {
            match run.phase {
                DecryptionPhase::CompensatedShares => self.schedule_compensated(&run)?,
                DecryptionPhase::Completed => self.finish_run(&run)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn schedule_compensated(&self, run: &DecryptionProgress) -> Result<()> {
        let election = self.store.election(&run.election_id)?;
        let mut tasks = Vec::new();
        for chunk_id in election.chunk_ids() {
            for missing in election.guardians.iter().filter(|g| g.id != run.guardian_id) {
                tasks.push(Task::CompensatedDecrypt {
                    election_id: election.id.clone(),
                    chunk_id: chunk_id.clone(),
                    guardian_id: run.guardian_id.clone(),
                    missing_guardian_id: missing.id.clone(),
                    run_id: run.run_id.clone(),
                });
            }
        }

        let published = self.queue.publish_all(tasks).len();
        tracing::info!(
            "Guardian {} entering compensated phase for election {}: {} task(s)",
            run.guardian_id,
            run.election_id,
            published
        );
        Ok(())
    }

    /// Handler body for a `CompensatedDecrypt` task.
    pub async fn process_compensated(
        &self,
        election_id: &ElectionId,
        chunk_id: &ChunkId,
        guardian_id: &GuardianId,
        missing_guardian_id: &GuardianId,
        run_id: &JobId,
    ) -> Result<()> {
        if guardian_id == missing_guardian_id {
            return Err(TallyError::Permanent(format!(
                "guardian {} cannot compensate for itself",
                guardian_id
            )));
        }

        let Some(key) = self.active_key(
            election_id,
            guardian_id,
            run_id,
            DecryptionPhase::CompensatedShares,
        )?
        else {
            return Ok(());
        };

        let election = self.store.election(election_id)?;
        let (ordinal, encrypted_tally) = self.tallied_chunk(chunk_id)?;
        let unit = Self::compensated_unit(&election, ordinal, guardian_id, missing_guardian_id)?;

        let written = self
            .store
            .compensated(chunk_id, guardian_id, missing_guardian_id)
            .is_some_and(|share| &share.run_id == run_id);
        if !written {
            let backup_share = call_with_timeout(
                self.engine_timeout,
                "compensated_decrypt",
                self.engine
                    .compensated_decrypt(&encrypted_tally, &key, missing_guardian_id),
            )
            .await?;

            let stored = self.store.record_compensated(
                CompensatedDecryption {
                    chunk_id: chunk_id.clone(),
                    compensating_guardian_id: guardian_id.clone(),
                    missing_guardian_id: missing_guardian_id.clone(),
                    backup_share,
                    run_id: run_id.clone(),
                },
                |run| self.progress.is_active_run(election_id, guardian_id, run),
            );
            if !stored {
                return Ok(());
            }
        }

        if let Some(run) = self.progress.record_compensated_done(
            election_id,
            guardian_id,
            run_id,
            missing_guardian_id,
            unit,
        ) && run.phase == DecryptionPhase::Completed
        {
            self.finish_run(&run)?;
        }
        Ok(())
    }

    /// Index of a backup share within its run: `ordinal * (guardians - 1) + position`, where
    /// `position` is the missing guardian's place among the other guardians.
    fn compensated_unit(
        election: &Election,
        ordinal: u64,
        guardian_id: &GuardianId,
        missing_guardian_id: &GuardianId,
    ) -> Result<u64> {
        let mut others = election.guardians.iter().filter(|g| &g.id != guardian_id);
        let position = others
            .position(|g| &g.id == missing_guardian_id)
            .ok_or_else(|| {
                TallyError::Permanent(format!(
                    "guardian {} is not registered for election {}",
                    missing_guardian_id, election.id
                ))
            })?;
        let others_count = election.guardians.len().saturating_sub(1) as u64;
        Ok(ordinal * others_count + position as u64)
    }

    fn finish_run(&self, run: &DecryptionProgress) -> Result<()> {
        self.store.drop_key_share(&run.election_id, &run.guardian_id);
        tracing::info!(
            "Guardian {} completed decryption run {} for election {}",
            run.guardian_id,
            run.run_id,
            run.election_id
        );
        self.aggregator.schedule_combine(&run.election_id)?;
        Ok(())
    }

    /// Failure hook for decryption tasks: fails the run (if still active) and releases the key.
    pub fn on_decryption_failed(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
        chunk_id: &ChunkId,
        error: &str,
    ) {
        let message = format!("chunk {} failed: {}", chunk_id, error);
        if self
            .progress
            .record_decryption_failed(election_id, guardian_id, run_id, message)
        {
            self.store.drop_key_share(election_id, guardian_id);
            tracing::error!(
                "Decryption run {} for guardian {} failed on chunk {}: {}",
                run_id,
                guardian_id,
                chunk_id,
                error
            );
        }
    }

    /// Operator override: fails the guardian's in-flight run so the next submission restarts
    /// it. Returns `false` when no run is in flight.
    pub fn fail_run(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        reason: &str,
    ) -> Result<bool> {
        let election = self.store.election(election_id)?;
        if election.guardian(guardian_id).is_none() {
            return Err(TallyError::not_found("guardian", guardian_id));
        }
        let Some(run) = self.progress.decryption(election_id, guardian_id) else {
            return Ok(false);
        };

        let failed = self.progress.record_decryption_failed(
            election_id,
            guardian_id,
            &run.run_id,
            format!("abandoned by operator: {}", reason),
        );
        if failed {
            self.store.drop_key_share(election_id, guardian_id);
            tracing::warn!(
                "Decryption run {} for guardian {} in election {} failed by operator: {}",
                run.run_id,
                guardian_id,
                election_id,
                reason
            );
        }
        Ok(failed)
    }

    /// `getDecryptionStatus`. A guardian that never submitted reports `Pending` with the totals
    /// its run would have.
    pub fn get_decryption_status(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
    ) -> Result<DecryptionStatusView> {
        let election = self.store.election(election_id)?;
        if election.guardian(guardian_id).is_none() {
            return Err(TallyError::not_found("guardian", guardian_id));
        }

        Ok(match self.progress.decryption(election_id, guardian_id) {
            Some(run) => DecryptionStatusView::from(&run),
            None => {
                let (total_chunks, total_compensated) = Self::totals(&election);
                DecryptionStatusView {
                    phase: DecryptionPhase::Pending,
                    processed_chunks: 0,
                    total_chunks,
                    compensating_for_guardian_id: None,
                    processed_compensated: 0,
                    total_compensated,
                    error_message: None,
                }
            }
        })
    }
}
