use super::types::*;
use crate::executor::types::now_ms;
use crate::storage::memory::PartitionedMap;
use crate::storage::types::{ElectionId, GuardianId, JobId};

use serde::{Deserialize, Serialize};

type DecryptionKey = (ElectionId, GuardianId);

/// Persistent status records for tally jobs and guardian decryption runs.
///
/// Every mutation is a single compare-and-set on the row, so concurrent workers (or processes
/// sharing the backing store) never lose an increment and never see a counter jump.
pub struct ProgressTracker {
    tally: PartitionedMap<ElectionId, TallyProgress>,
    decryption: PartitionedMap<DecryptionKey, DecryptionProgress>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub tally: Vec<(ElectionId, TallyProgress)>,
    pub decryption: Vec<(DecryptionKey, DecryptionProgress)>,
}

impl ProgressTracker {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            tally: PartitionedMap::new(num_partitions),
            decryption: PartitionedMap::new(num_partitions),
        }
    }

    // --- Tally ---

    pub fn init_tally(&self, election_id: &ElectionId, total_chunks: u64) -> TallyInit {
        self.tally.compute(election_id.clone(), |slot| match slot {
            None => {
                let progress = TallyProgress {
                    election_id: election_id.clone(),
                    job_id: JobId::new(),
                    status: JobStatus::Pending,
                    processed_chunks: 0,
                    failed_chunks: 0,
                    total_chunks,
                    error_message: None,
                    updated_at: now_ms(),
                    counted: CountedUnits::default(),
                };
                *slot = Some(progress.clone());
                TallyInit::Created(progress)
            }
            Some(progress) if progress.status == JobStatus::Failed => {
                // Completed chunks keep their count; only the failure is cleared.
                progress.status = JobStatus::InProgress;
                progress.failed_chunks = 0;
                progress.error_message = None;
                progress.updated_at = now_ms();
                TallyInit::Retrying(progress.clone())
            }
            Some(progress) => TallyInit::Existing(progress.clone()),
        })
    }

    /// PENDING -> IN_PROGRESS on the first chunk that starts.
    pub fn mark_tally_started(&self, election_id: &ElectionId) {
        self.tally.update(election_id, |progress| {
            if progress.status == JobStatus::Pending {
                progress.status = JobStatus::InProgress;
                progress.updated_at = now_ms();
                tracing::info!("Tally for election {} started", election_id);
            }
        });
    }

    /// Counts chunk `ordinal` once. Completion is declared when the counter reaches the total
    /// fixed at job creation and no chunk has failed.
    ///
    /// Returns `None` when the chunk was already counted (or is out of range), so a redelivered
    /// task can report its chunk again without inflating the counter.
    pub fn record_tally_chunk_done(
        &self,
        election_id: &ElectionId,
        ordinal: u64,
    ) -> Option<TallyProgress> {
        self.tally
            .update(election_id, |progress| {
                if ordinal >= progress.total_chunks {
                    tracing::warn!(
                        "Ignoring completion of chunk {} for election {} ({} chunks)",
                        ordinal,
                        election_id,
                        progress.total_chunks
                    );
                    return None;
                }
                if !progress.counted.insert(ordinal) {
                    return None;
                }

                progress.processed_chunks += 1;
                if progress.status == JobStatus::Pending {
                    progress.status = JobStatus::InProgress;
                }
                if progress.processed_chunks == progress.total_chunks
                    && progress.status == JobStatus::InProgress
                {
                    progress.status = JobStatus::Completed;
                    tracing::info!(
                        "Tally for election {} completed ({} chunks)",
                        election_id,
                        progress.total_chunks
                    );
                }
                progress.updated_at = now_ms();
                Some(progress.clone())
            })
            .flatten()
    }

    /// Records a terminally failed chunk. The first failure's message is kept.
    /// A completed job is never reopened.
    pub fn record_tally_chunk_failed(&self, election_id: &ElectionId, message: String) {
        self.tally.update(election_id, |progress| {
            if progress.status == JobStatus::Completed {
                tracing::warn!(
                    "Ignoring chunk failure for completed tally of election {}: {}",
                    election_id,
                    message
                );
                return;
            }
            progress.failed_chunks += 1;
            progress.status = JobStatus::Failed;
            if progress.error_message.is_none() {
                progress.error_message = Some(message);
            }
            progress.updated_at = now_ms();
        });
    }

    pub fn tally(&self, election_id: &ElectionId) -> Option<TallyProgress> {
        self.tally.get(election_id)
    }

    // --- Decryption ---

    /// The compare-and-set guarding guardian runs: absent/PENDING or FAILED -> IN_PROGRESS.
    pub fn try_begin_decryption(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        total_chunks: u64,
        total_compensated: u64,
    ) -> DecryptionBegin {
        let key = (election_id.clone(), guardian_id.clone());
        self.decryption.compute(key, |slot| {
            let fresh = || DecryptionProgress {
                election_id: election_id.clone(),
                guardian_id: guardian_id.clone(),
                run_id: JobId::new(),
                phase: DecryptionPhase::PartialDecryption,
                processed_chunks: 0,
                total_chunks,
                compensating_for: None,
                processed_compensated: 0,
                total_compensated,
                error_message: None,
                updated_at: now_ms(),
                counted_chunks: CountedUnits::default(),
                counted_compensated: CountedUnits::default(),
            };

            match slot {
                None => {
                    let progress = fresh();
                    *slot = Some(progress.clone());
                    DecryptionBegin::Started(progress)
                }
                Some(existing) => match existing.phase {
                    DecryptionPhase::Pending => {
                        let progress = fresh();
                        *existing = progress.clone();
                        DecryptionBegin::Started(progress)
                    }
                    DecryptionPhase::Failed => {
                        let progress = fresh();
                        *existing = progress.clone();
                        DecryptionBegin::Restarted(progress)
                    }
                    DecryptionPhase::PartialDecryption | DecryptionPhase::CompensatedShares => {
                        DecryptionBegin::Attached(existing.clone())
                    }
                    DecryptionPhase::Completed => {
                        DecryptionBegin::AlreadyCompleted(existing.clone())
                    }
                },
            }
        })
    }

    /// Counts the direct share of chunk `ordinal` for `run_id`, once.
    ///
    /// Returns the updated run only when this call counted the share; `None` for a stale or
    /// inactive run, or for a share already counted.
    pub fn record_partial_done(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
        ordinal: u64,
    ) -> Option<DecryptionProgress> {
        let key = (election_id.clone(), guardian_id.clone());
        self.decryption
            .update(&key, |progress| {
                if &progress.run_id != run_id
                    || progress.phase != DecryptionPhase::PartialDecryption
                    || ordinal >= progress.total_chunks
                    || !progress.counted_chunks.insert(ordinal)
                {
                    return None;
                }

                progress.processed_chunks += 1;
                if progress.processed_chunks == progress.total_chunks {
                    progress.phase = if progress.total_compensated == 0 {
                        DecryptionPhase::Completed
                    } else {
                        DecryptionPhase::CompensatedShares
                    };
                    tracing::info!(
                        "Guardian {} finished partial decryption for election {}",
                        guardian_id,
                        election_id
                    );
                }
                progress.updated_at = now_ms();
                Some(progress.clone())
            })
            .flatten()
    }

    /// Counts backup share `unit` for `run_id`, once. Same contract as
    /// [`record_partial_done`](Self::record_partial_done).
    pub fn record_compensated_done(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
        missing_guardian_id: &GuardianId,
        unit: u64,
    ) -> Option<DecryptionProgress> {
        let key = (election_id.clone(), guardian_id.clone());
        self.decryption
            .update(&key, |progress| {
                if &progress.run_id != run_id
                    || progress.phase != DecryptionPhase::CompensatedShares
                    || unit >= progress.total_compensated
                    || !progress.counted_compensated.insert(unit)
                {
                    return None;
                }

                progress.processed_compensated += 1;
                progress.compensating_for = Some(missing_guardian_id.clone());
                if progress.processed_compensated == progress.total_compensated {
                    progress.phase = DecryptionPhase::Completed;
                    tracing::info!(
                        "Guardian {} completed decryption for election {}",
                        guardian_id,
                        election_id
                    );
                }
                progress.updated_at = now_ms();
                Some(progress.clone())
            })
            .flatten()
    }

    /// Fails the run if it is still the active one. Returns whether anything changed.
    pub fn record_decryption_failed(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
        message: String,
    ) -> bool {
        let key = (election_id.clone(), guardian_id.clone());
        self.decryption
            .update(&key, |progress| {
                if &progress.run_id != run_id || !progress.phase.is_active() {
                    return false;
                }
                progress.phase = DecryptionPhase::Failed;
                progress.error_message = Some(message);
                progress.updated_at = now_ms();
                true
            })
            .unwrap_or(false)
    }

    /// Whether `run_id` is the guardian's current run and still in flight.
    pub fn is_active_run(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        run_id: &JobId,
    ) -> bool {
        self.decryption
            .get(&(election_id.clone(), guardian_id.clone()))
            .is_some_and(|run| &run.run_id == run_id && run.phase.is_active())
    }

    pub fn decryption(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
    ) -> Option<DecryptionProgress> {
        self.decryption
            .get(&(election_id.clone(), guardian_id.clone()))
    }

    // --- Snapshot ---

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            tally: self.tally.dump(),
            decryption: self.decryption.dump(),
        }
    }

    pub fn restore(&self, snapshot: ProgressSnapshot) {
        self.tally.apply_entries(snapshot.tally);
        self.decryption.apply_entries(snapshot.decryption);
    }
}
