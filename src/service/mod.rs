//! Tally Service
//!
//! The facade the (external) API layer talks to. It owns the shared tables, the task queue and
//! the worker pool, registers the handler for every task kind and exposes the pipeline's
//! operations:
//!
//! | Operation                       | Method                                 |
//! |---------------------------------|----------------------------------------|
//! | `initiateTally`                 | [`TallyService::initiate_tally`]       |
//! | `getTallyStatus`                | [`TallyService::get_tally_status`]     |
//! | `initiateDecryption`            | [`TallyService::initiate_decryption`]  |
//! | `getDecryptionStatus`           | [`TallyService::get_decryption_status`]|
//! | `getElectionDecryptionStatus`   | [`TallyService::get_election_decryption_status`] |
//! | `combineElection`               | [`TallyService::combine_election`]     |
//! | `getAggregatedResult`           | [`TallyService::get_aggregated_result`]|
//! | `abandonTask`                   | [`TallyService::abandon_task`]         |
//! | `failDecryptionRun`             | [`TallyService::fail_decryption_run`]  |

use crate::aggregation::{self, AggregatedResult, ElectionDecryptionStatus, ResultAggregator};
use crate::config::PipelineConfig;
use crate::decryption::{self, DecryptionDecision, DecryptionOrchestrator};
use crate::engine::TallyEngine;
use crate::error::Result;
use crate::executor::types::QueueStats;
use crate::executor::{TaskExecutor, TaskHandlerRegistry, TaskId, TaskQueue};
use crate::progress::{DecryptionStatusView, ProgressTracker, TallyStatusView};
use crate::storage::snapshot::{SNAPSHOT_VERSION, StateSnapshot};
use crate::storage::TallyStore;
use crate::storage::types::{BallotId, ElectionId, ElectionSetup, GuardianId, JobId};
use crate::tally::{self, TallyOrchestrator};

use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct TallyService {
    config: PipelineConfig,
    store: Arc<TallyStore>,
    progress: Arc<ProgressTracker>,
    queue: Arc<TaskQueue>,
    executor: Arc<TaskExecutor>,
    tally: Arc<TallyOrchestrator>,
    decryption: Arc<DecryptionOrchestrator>,
    aggregator: Arc<ResultAggregator>,
}

impl TallyService {
    pub fn new(config: PipelineConfig, engine: Arc<dyn TallyEngine>) -> Result<Arc<Self>> {
        config.validate()?;

        let partitions = config.task_partitions;
        let store = Arc::new(TallyStore::new(partitions));
        let progress = Arc::new(ProgressTracker::new(partitions));
        let queue = Arc::new(TaskQueue::new(config.queue_config()));
        let timeout = config.engine_timeout();

        let aggregator = Arc::new(ResultAggregator::new(
            store.clone(),
            progress.clone(),
            queue.clone(),
            engine.clone(),
            timeout,
        ));
        let tally = Arc::new(TallyOrchestrator::new(
            store.clone(),
            progress.clone(),
            queue.clone(),
            engine.clone(),
            timeout,
        ));
        let decryption = Arc::new(DecryptionOrchestrator::new(
            store.clone(),
            progress.clone(),
            queue.clone(),
            engine,
            aggregator.clone(),
            timeout,
        ));

        let registry = TaskHandlerRegistry::new();
        tally::handlers::register(&registry, tally.clone());
        decryption::handlers::register(&registry, decryption.clone());
        aggregation::handlers::register(&registry, aggregator.clone());
        tracing::debug!("{} task handler(s) registered", registry.handler_count());

        let executor = TaskExecutor::new(queue.clone(), registry, config.executor_config());

        Ok(Arc::new(Self {
            config,
            store,
            progress,
            queue,
            executor,
            tally,
            decryption,
            aggregator,
        }))
    }

    /// Rebuilds a service from a snapshot written by [`save_snapshot`](Self::save_snapshot).
    pub fn from_snapshot(
        config: PipelineConfig,
        engine: Arc<dyn TallyEngine>,
        snapshot: StateSnapshot,
    ) -> Result<Arc<Self>> {
        let service = Self::new(config, engine)?;
        service.store.restore(snapshot.store);
        service.progress.restore(snapshot.progress);
        service.queue.restore(snapshot.tasks);
        Ok(service)
    }

    pub fn load_snapshot(
        config: PipelineConfig,
        engine: Arc<dyn TallyEngine>,
        path: &Path,
    ) -> Result<Arc<Self>> {
        Self::from_snapshot(config, engine, StateSnapshot::load(path)?)
    }

    /// Captures every table and the task queue.
    ///
    /// Workers are paused for the duration, so no task is half applied in the result. Callers
    /// should not initiate tallies or decryptions concurrently with a snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        let _paused = self.executor.pause().await;
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            store: self.store.snapshot(),
            progress: self.progress.snapshot(),
            tasks: self.queue.snapshot(),
        }
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        self.snapshot().await.save(path)
    }

    // --- Election setup ---

    pub fn register_election(&self, setup: ElectionSetup) -> Result<()> {
        self.store.register_election(setup)
    }

    pub fn add_ballot(
        &self,
        election_id: &ElectionId,
        ballot_id: BallotId,
        ciphertext: Vec<u8>,
    ) -> Result<()> {
        self.store.add_ballot(election_id, ballot_id, ciphertext)
    }

    // --- Tally ---

    /// `initiateTally` with the configured chunk size.
    pub fn initiate_tally(&self, election_id: &ElectionId) -> Result<JobId> {
        self.tally
            .initiate_tally(election_id, self.config.chunk_size)
    }

    pub fn initiate_tally_with_chunk_size(
        &self,
        election_id: &ElectionId,
        chunk_size: usize,
    ) -> Result<JobId> {
        self.tally.initiate_tally(election_id, chunk_size)
    }

    pub fn get_tally_status(&self, election_id: &ElectionId) -> Result<TallyStatusView> {
        self.tally.get_tally_status(election_id)
    }

    // --- Decryption ---

    pub fn initiate_decryption(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        credential: &[u8],
    ) -> Result<DecryptionDecision> {
        self.decryption
            .initiate_decryption(election_id, guardian_id, credential)
    }

    pub fn get_decryption_status(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
    ) -> Result<DecryptionStatusView> {
        self.decryption
            .get_decryption_status(election_id, guardian_id)
    }

    // --- Aggregation ---

    pub fn get_election_decryption_status(
        &self,
        election_id: &ElectionId,
    ) -> Result<ElectionDecryptionStatus> {
        self.aggregator.election_decryption_status(election_id)
    }

    /// Enqueues combination of every chunk not yet combined. Returns the number of tasks.
    pub fn combine_election(&self, election_id: &ElectionId) -> Result<usize> {
        self.aggregator.combine_election(election_id)
    }

    pub fn get_aggregated_result(&self, election_id: &ElectionId) -> Result<AggregatedResult> {
        self.aggregator.aggregated_result(election_id)
    }

    // --- Workers ---

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.executor.start()
    }

    pub fn shutdown(&self) {
        self.executor.shutdown();
    }

    /// Processes tasks until none is pending or running.
    pub async fn run_until_idle(&self) -> QueueStats {
        self.executor.run_until_idle().await
    }

    /// Operator override for a stuck task.
    pub async fn abandon_task(&self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.executor.abandon(task_id, reason).await
    }

    /// Operator override for a stalled decryption run: fails it so the guardian can resubmit.
    pub fn fail_decryption_run(
        &self,
        election_id: &ElectionId,
        guardian_id: &GuardianId,
        reason: &str,
    ) -> Result<bool> {
        self.decryption.fail_run(election_id, guardian_id, reason)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<TallyStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests;
