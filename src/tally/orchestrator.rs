//! Tally Orchestrator
//!
//! Turns an election's ballot set into one encrypted tally blob per chunk.
//!
//! ## Responsibilities
//! - **Initiation**: freezes the ballot set into chunks (once), creates the job record and
//!   publishes one `Tally` task per chunk. Re-initiating a failed job requeues only the chunks
//!   that failed.
//! - **Chunk processing**: loads the ciphertexts of a single chunk, calls the engine under a
//!   deadline, stores the blob and counts the chunk exactly once.
//! - **Failure attribution**: a chunk whose task fails terminally is marked `TallyFailed` and
//!   the job record names it; sibling chunks carry on.

use crate::chunking;
use crate::engine::{TallyEngine, call_with_timeout};
use crate::error::{Result, TallyError};
use crate::executor::{Task, TaskQueue};
use crate::progress::{JobStatus, ProgressTracker, TallyInit, TallyStatusView};
use crate::storage::TallyStore;
use crate::storage::types::{ChunkId, ChunkStatus, Election, ElectionId, JobId};

use std::sync::Arc;
use std::time::Duration;

pub struct TallyOrchestrator {
    store: Arc<TallyStore>,
    progress: Arc<ProgressTracker>,
    queue: Arc<TaskQueue>,
    engine: Arc<dyn TallyEngine>,
    engine_timeout: Duration,
}

impl TallyOrchestrator {
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

    /// Starts (or returns) the tally job for an election.
    ///
    /// - No job yet: chunks the ballots and enqueues every chunk.
    /// - Job pending, running or complete: returns its id unchanged. An unfinished job first
    ///   counts any tallied chunk its record is missing.
    /// - Job failed: resets the failed chunks and enqueues only those.
    pub fn initiate_tally(&self, election_id: &ElectionId, chunk_size: usize) -> Result<JobId> {
        chunking::validate_chunk_size(chunk_size)?;
        let election = self.store.election(election_id)?;

        if let Some(existing) = self.progress.tally(election_id)
            && existing.status != JobStatus::Failed
        {
            tracing::debug!(
                "Tally for election {} already exists ({:?})",
                election_id,
                existing.status
            );
            if existing.status != JobStatus::Completed {
                self.reconcile_tallied(&election);
            }
            return Ok(existing.job_id);
        }

        let election = if election.chunk_count.is_none() {
            self.freeze(&election, chunk_size)?
        } else {
            if election.chunk_size != Some(chunk_size) {
                tracing::debug!(
                    "Election {} is already chunked with size {:?}; ignoring requested size {}",
                    election_id,
                    election.chunk_size,
                    chunk_size
                );
            }
            election
        };

        let total_chunks = election.chunk_count.unwrap_or(0);
        match self.progress.init_tally(election_id, total_chunks) {
            TallyInit::Created(progress) => {
                let tasks = self.tally_tasks(&election, |status| status != ChunkStatus::Tallied);
                let published = self.queue.publish_all(tasks).len();
                tracing::info!(
                    "Initiated tally job {} for election {}: {} chunk task(s)",
                    progress.job_id,
                    election_id,
                    published
                );
                Ok(progress.job_id)
            }
            TallyInit::Existing(progress) => Ok(progress.job_id),
            TallyInit::Retrying(progress) => {
                self.reconcile_tallied(&election);
                let reset = self.reset_failed_chunks(&election)?;
                let tasks = reset.into_iter().map(|chunk_id| Task::Tally {
                    election_id: election_id.clone(),
                    chunk_id,
                });
                let published = self.queue.publish_all(tasks).len();
                tracing::info!(
                    "Retrying tally job {} for election {}: {} failed chunk(s) requeued",
                    progress.job_id,
                    election_id,
                    published
                );
                Ok(progress.job_id)
            }
        }
    }

    /// Chunks the current ballot set and returns the updated election.
    fn freeze(&self, election: &Election, chunk_size: usize) -> Result<Election> {
        let ballot_ids = self.store.election_ballot_ids(&election.id);
        if ballot_ids.is_empty() {
            return Err(TallyError::Validation(format!(
                "election {} has no ballots to tally",
                election.id
            )));
        }

        let plan = chunking::partition_ballots(&election.id, &ballot_ids, chunk_size)?;
        if !self.store.freeze_chunks(&election.id, chunk_size, plan)? {
            tracing::debug!("Election {} was chunked by a concurrent caller", election.id);
        }
        self.store.election(&election.id)
    }

    fn tally_tasks(&self, election: &Election, include: impl Fn(ChunkStatus) -> bool) -> Vec<Task> {
        self.store
            .chunks_for(election)
            .into_iter()
            .filter(|chunk| include(chunk.status))
            .map(|chunk| Task::Tally {
                election_id: election.id.clone(),
                chunk_id: chunk.id,
            })
            .collect()
    }

    /// Counts every chunk already holding its blob. Counting is per ordinal, so chunks counted
    /// before are unaffected; a chunk whose count was lost after its blob was written is healed.
    fn reconcile_tallied(&self, election: &Election) {
        let healed = self
            .store
            .chunks_for(election)
            .into_iter()
            .filter(|chunk| matches!(chunk.status, ChunkStatus::Tallied | ChunkStatus::Combined))
            .filter(|chunk| {
                self.progress
                    .record_tally_chunk_done(&election.id, chunk.ordinal)
                    .is_some()
            })
            .count() as u64;
        if healed > 0 {
            tracing::warn!(
                "Recounted {} tallied chunk(s) of election {} missing from its job record",
                healed,
                election.id
            );
        }
    }

    fn reset_failed_chunks(&self, election: &Election) -> Result<Vec<ChunkId>> {
        let mut reset = Vec::new();
        for chunk_id in election.chunk_ids() {
            let was_failed = self.store.update_chunk(&chunk_id, |chunk| {
                if chunk.status != ChunkStatus::TallyFailed {
                    return false;
                }
                chunk.status = ChunkStatus::Pending;
                chunk.last_error = None;
                true
            })?;
            if was_failed {
                reset.push(chunk_id);
            }
        }
        Ok(reset)
    }

    /// Handler body for a `Tally` task.
    ///
    /// Redelivered tasks are harmless: a chunk already `Tallied` is not sent to the engine
    /// again, and the job record counts each chunk ordinal once. A redelivery still reports
    /// the chunk, which recovers a count lost between the blob write and the increment.
    pub async fn process_tally_chunk(
        &self,
        election_id: &ElectionId,
        chunk_id: &ChunkId,
    ) -> Result<()> {
        self.progress.mark_tally_started(election_id);

        let already_tallied = self.store.update_chunk(chunk_id, |chunk| match chunk.status {
            ChunkStatus::Tallied | ChunkStatus::Combined => Some(chunk.ordinal),
            _ => {
                chunk.status = ChunkStatus::Tallying;
                chunk.attempts += 1;
                None
            }
        })?;
        if let Some(ordinal) = already_tallied {
            tracing::debug!("Chunk {} already tallied, skipping", chunk_id);
            self.count_chunk(election_id, ordinal);
            return Ok(());
        }

        let chunk = self.store.chunk(chunk_id)?;
        let ciphertexts = self.store.chunk_ciphertexts(&chunk)?;
        tracing::debug!(
            "Tallying chunk {} ({} ballots, attempt {})",
            chunk_id,
            ciphertexts.len(),
            chunk.attempts
        );

        let outcome =
            call_with_timeout(self.engine_timeout, "tally", self.engine.tally(&ciphertexts)).await;

        match outcome {
            Ok(encrypted_tally) => {
                let tallied = self.store.update_chunk(chunk_id, |chunk| match chunk.status {
                    ChunkStatus::Tallying => {
                        chunk.encrypted_tally = Some(encrypted_tally);
                        chunk.status = ChunkStatus::Tallied;
                        chunk.last_error = None;
                        Some(chunk.ordinal)
                    }
                    ChunkStatus::Tallied | ChunkStatus::Combined => Some(chunk.ordinal),
                    _ => None,
                })?;

                if let Some(ordinal) = tallied {
                    self.count_chunk(election_id, ordinal);
                }
                Ok(())
            }
            Err(error) => {
                self.store.update_chunk(chunk_id, |chunk| {
                    chunk.last_error = Some(error.to_string());
                    if chunk.status == ChunkStatus::Tallying {
                        chunk.status = ChunkStatus::Pending;
                    }
                })?;
                Err(error)
            }
        }
    }

    fn count_chunk(&self, election_id: &ElectionId, ordinal: u64) {
        if let Some(progress) = self.progress.record_tally_chunk_done(election_id, ordinal) {
            tracing::debug!(
                "Election {} tally progress: {}/{}",
                election_id,
                progress.processed_chunks,
                progress.total_chunks
            );
        }
    }

    /// Failure hook for `Tally` tasks: the chunk is parked as `TallyFailed` and the job record
    /// is failed with a message naming the chunk. A chunk that already holds its blob keeps it
    /// and the job record is left alone.
    pub fn on_tally_failed(&self, election_id: &ElectionId, chunk_id: &ChunkId, error: &str) {
        let parked = self.store.update_chunk(chunk_id, |chunk| match chunk.status {
            ChunkStatus::Tallied | ChunkStatus::Combined => None,
            _ => {
                chunk.status = ChunkStatus::TallyFailed;
                chunk.last_error = Some(error.to_string());
                Some(chunk.ordinal)
            }
        });

        let message = match parked {
            Ok(Some(ordinal)) => format!("chunk {} ({}) failed: {}", ordinal, chunk_id, error),
            Ok(None) => {
                tracing::debug!(
                    "Chunk {} of election {} is already tallied; ignoring late failure: {}",
                    chunk_id,
                    election_id,
                    error
                );
                return;
            }
            Err(_) => format!("chunk {} failed: {}", chunk_id, error),
        };
        tracing::error!("Tally for election {}: {}", election_id, message);
        self.progress.record_tally_chunk_failed(election_id, message);
    }

    /// `getTallyStatus`. An election whose tally was never initiated reports `Pending`.
    pub fn get_tally_status(&self, election_id: &ElectionId) -> Result<TallyStatusView> {
        let election = self.store.election(election_id)?;
        Ok(match self.progress.tally(election_id) {
            Some(progress) => TallyStatusView::from(&progress),
            None => TallyStatusView {
                status: JobStatus::Pending,
                processed_chunks: 0,
                total_chunks: election.chunk_count.unwrap_or(0),
                failed_chunks: 0,
                error_message: None,
            },
        })
    }
}
