//! Service Tests
//!
//! End-to-end scenarios through the public facade: failure isolation between chunks, retries,
//! engine timeouts, restarts from a snapshot and operator overrides.

#[cfg(test)]
mod tests {
    use crate::config::PipelineConfig;
    use crate::decryption::DecryptionDecision;
    use crate::engine::mock::MockEngine;
    use crate::error::TallyError;
    use crate::executor::TaskKind;
    use crate::executor::types::TaskStatus;
    use crate::progress::{DecryptionPhase, JobStatus};
    use crate::service::TallyService;
    use crate::storage::types::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 1,
            worker_count: 4,
            max_retries: 2,
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 4,
            engine_timeout_ms: 2_000,
            lease_ms: 5_000,
            poll_interval_ms: 2,
            task_partitions: 8,
        }
    }

    fn setup(config: PipelineConfig, ballots: usize) -> (Arc<TallyService>, Arc<MockEngine>, ElectionId) {
        let engine = Arc::new(MockEngine::new());
        let service = TallyService::new(config, engine.clone()).unwrap();
        let election_id = ElectionId::from("e1");
        register(&service, &election_id, ballots);
        (service, engine, election_id)
    }

    fn register(service: &TallyService, election_id: &ElectionId, ballots: usize) {
        service
            .register_election(ElectionSetup {
                election_id: election_id.clone(),
                candidates: vec!["yes".into(), "no".into()],
                guardians: vec![
                    GuardianRegistration {
                        id: GuardianId::from("g1"),
                        sequence_order: 1,
                        key_share: b"key-1".to_vec(),
                    },
                    GuardianRegistration {
                        id: GuardianId::from("g2"),
                        sequence_order: 2,
                        key_share: b"key-2".to_vec(),
                    },
                ],
                threshold: 1,
            })
            .unwrap();
        for i in 0..ballots {
            let candidate = if i % 4 == 0 { "no" } else { "yes" };
            service
                .add_ballot(
                    election_id,
                    BallotId(format!("b{}", i)),
                    MockEngine::encrypt_vote(candidate),
                )
                .unwrap();
        }
    }

    // ============================================================
    // TEST 1: Failure Isolation and Retry
    // ============================================================

    #[tokio::test]
    async fn test_one_bad_chunk_does_not_block_the_others() {
        // ARRANGE: 10 chunks of one ballot; b7 is rejected by the engine
        let (service, engine, election_id) = setup(test_config(), 10);
        engine.fail_tally_permanently(&BallotId::from("b7"));

        // ACT
        service.initiate_tally(&election_id).unwrap();
        let stats = service.run_until_idle().await;

        // ASSERT
        assert_eq!(stats.done, 9);
        assert_eq!(stats.failed, 1);
        let status = service.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.processed_chunks, 9);
        assert_eq!(status.failed_chunks, 1);

        // Ballots are shuffled into chunks; find where b7 landed
        let bad_chunk_id = service
            .store()
            .ballot(&BallotId::from("b7"))
            .and_then(|ballot| ballot.chunk_id)
            .unwrap();
        let failed = service.store().chunk(&bad_chunk_id).unwrap();
        assert_eq!(failed.status, ChunkStatus::TallyFailed);

        let message = status.error_message.unwrap();
        assert!(
            message.contains(&format!("chunk {} ({})", failed.ordinal, bad_chunk_id)),
            "failure not attributed: {}",
            message
        );
        assert!(message.contains("b7"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_completes_without_recounting() {
        // ARRANGE
        let (service, engine, election_id) = setup(test_config(), 10);
        engine.fail_tally_permanently(&BallotId::from("b7"));
        let job_id = service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;
        let calls_after_first_run = engine.tally_calls();

        // ACT: fault fixed, retry
        engine.clear_faults();
        let retry_id = service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;

        // ASSERT: only the failed chunk was re-run
        assert_eq!(retry_id, job_id);
        assert_eq!(engine.tally_calls(), calls_after_first_run + 1);
        let status = service.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.processed_chunks, 10);
        assert_eq!(status.total_chunks, 10);
        assert_eq!(status.failed_chunks, 0);
        assert_eq!(status.error_message, None);
    }

    #[tokio::test]
    async fn test_transient_faults_are_absorbed_by_retries() {
        let (service, engine, election_id) = setup(test_config(), 3);
        engine.fail_tally_transiently(&BallotId::from("b1"), 2);

        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;

        let status = service.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(engine.tally_calls(), 5);
    }

    #[tokio::test]
    async fn test_completed_status_is_stable() {
        let (service, _engine, election_id) = setup(test_config(), 4);
        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;

        let first = service.get_tally_status(&election_id).unwrap();
        let second = service.get_tally_status(&election_id).unwrap();
        service.initiate_tally(&election_id).unwrap();
        let third = service.get_tally_status(&election_id).unwrap();

        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    // ============================================================
    // TEST 2: Engine Timeouts
    // ============================================================

    #[tokio::test]
    async fn test_slow_engine_times_out_and_fails_after_retries() {
        // ARRANGE: engine slower than the deadline
        let config = PipelineConfig {
            engine_timeout_ms: 20,
            max_retries: 1,
            ..test_config()
        };
        let (service, engine, election_id) = setup(config, 1);
        engine.set_latency(Duration::from_millis(200));

        // ACT
        service.initiate_tally(&election_id).unwrap();
        let stats = service.run_until_idle().await;

        // ASSERT: first attempt plus one retry, then terminal
        assert_eq!(stats.failed, 1);
        assert_eq!(engine.tally_calls(), 2);
        let status = service.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status.error_message.unwrap().contains("timed out"));

        // The chunk went back to a retryable state
        let chunk = service
            .store()
            .chunk(&ChunkId::for_chunk(&election_id, 0))
            .unwrap();
        assert_eq!(chunk.status, ChunkStatus::TallyFailed);
        assert_eq!(chunk.attempts, 2);
    }

    // ============================================================
    // TEST 3: Snapshots
    // ============================================================

    #[tokio::test]
    async fn test_snapshot_resumes_pending_tally() {
        // ARRANGE: tasks published but never run
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let (service, _engine, election_id) = setup(test_config(), 6);
        let job_id = service.initiate_tally(&election_id).unwrap();
        service.save_snapshot(&path).await.unwrap();
        drop(service);

        // ACT: a new process picks up where the old one stopped
        let restored =
            TallyService::load_snapshot(test_config(), Arc::new(MockEngine::new()), &path).unwrap();
        assert_eq!(restored.queue_stats().pending, 6);
        restored.run_until_idle().await;

        // ASSERT
        assert_eq!(restored.initiate_tally(&election_id).unwrap(), job_id);
        let status = restored.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.processed_chunks, 6);
    }

    #[tokio::test]
    async fn test_snapshot_taken_while_workers_run_is_consistent() {
        // ARRANGE: slow engine, background workers busy
        let (service, engine, election_id) = setup(test_config(), 12);
        engine.set_latency(Duration::from_millis(10));
        let handles = service.start();
        service.initiate_tally(&election_id).unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        // ACT
        let snapshot = service.snapshot().await;
        service.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        // ASSERT: no task caught mid-flight, counts agree with the chunk rows
        assert!(
            snapshot
                .tasks
                .iter()
                .all(|(_, entry)| entry.status == TaskStatus::Pending)
        );
        let tallied = snapshot
            .store
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.status == ChunkStatus::Tallied)
            .count() as u64;
        let (_, progress) = snapshot
            .progress
            .tally
            .iter()
            .find(|(id, _)| id == &election_id)
            .unwrap();
        assert_eq!(progress.processed_chunks, tallied);
        assert_eq!(snapshot.tasks.len() as u64 + tallied, 12);

        // ACT: resume elsewhere
        let restored =
            TallyService::from_snapshot(test_config(), Arc::new(MockEngine::new()), snapshot)
                .unwrap();
        restored.run_until_idle().await;

        // ASSERT
        let status = restored.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.processed_chunks, 12);
    }

    #[tokio::test]
    async fn test_finished_pipeline_leaves_no_task_rows() {
        // ARRANGE
        let (service, _engine, election_id) = setup(test_config(), 6);

        // ACT: tally, both guardians decrypt, combine
        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;
        for (guardian, key) in [("g1", b"key-1"), ("g2", b"key-2")] {
            service
                .initiate_decryption(&election_id, &GuardianId::from(guardian), key)
                .unwrap();
            service.run_until_idle().await;
        }

        // ASSERT: totals kept, rows gone
        assert!(service.get_aggregated_result(&election_id).is_ok());
        let stats = service.queue_stats();
        assert!(stats.done > 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(service.queue().task_count(), 0);
        assert!(service.snapshot().await.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_restored_run_resumes_after_guardian_resubmits() {
        // ARRANGE: decryption accepted, then the process stops before any task ran
        let (service, _engine, election_id) = setup(test_config(), 3);
        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;
        let DecryptionDecision::Accepted { run_id, .. } = service
            .initiate_decryption(&election_id, &GuardianId::from("g1"), b"key-1")
            .unwrap()
        else {
            panic!("expected accepted");
        };
        let snapshot = service.snapshot().await;

        // ACT: key shares are not part of the snapshot; attaching supplies it again
        let restored =
            TallyService::from_snapshot(test_config(), Arc::new(MockEngine::new()), snapshot)
                .unwrap();
        let decision = restored
            .initiate_decryption(&election_id, &GuardianId::from("g1"), b"key-1")
            .unwrap();
        assert!(matches!(decision, DecryptionDecision::Attached { .. }));
        restored.run_until_idle().await;

        // ASSERT
        let status = restored
            .get_decryption_status(&election_id, &GuardianId::from("g1"))
            .unwrap();
        assert_eq!(status.phase, DecryptionPhase::Completed);
        assert_eq!(status.processed_chunks, 3);
        assert_eq!(
            restored.get_aggregated_result(&election_id).unwrap().final_counts["yes"],
            2
        );
        assert!(
            restored
                .store()
                .partial(&ChunkId::for_chunk(&election_id, 0), &GuardianId::from("g1"))
                .is_some_and(|share| share.run_id == run_id)
        );
    }

    // ============================================================
    // TEST 4: Operator Overrides and Configuration
    // ============================================================

    #[tokio::test]
    async fn test_abandoned_task_fails_its_chunk() {
        // ARRANGE
        let (service, _engine, election_id) = setup(test_config(), 3);
        service.initiate_tally(&election_id).unwrap();
        let (task_id, entry) = service
            .queue()
            .snapshot()
            .into_iter()
            .find(|(_, entry)| entry.task.kind() == TaskKind::Tally)
            .unwrap();
        let chunk_id = entry.task.chunk_id().clone();

        // ACT
        service.abandon_task(&task_id, "stuck on a dead node").await.unwrap();
        service.run_until_idle().await;

        // ASSERT: the remaining chunks still ran
        let status = service.get_tally_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.processed_chunks, 2);
        assert_eq!(status.failed_chunks, 1);
        assert!(status.error_message.unwrap().contains("stuck on a dead node"));
        assert_eq!(
            service.store().chunk(&chunk_id).unwrap().status,
            ChunkStatus::TallyFailed
        );

        // And the abandoned chunk can be retried
        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;
        assert_eq!(
            service.get_tally_status(&election_id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            worker_count: 0,
            ..test_config()
        };

        let result = TallyService::new(config, Arc::new(MockEngine::new()));

        assert!(matches!(result, Err(TallyError::Validation(_))));
    }

    #[tokio::test]
    async fn test_background_workers_process_tasks() {
        let (service, _engine, election_id) = setup(test_config(), 5);
        let handles = service.start();

        service.initiate_tally(&election_id).unwrap();
        for _ in 0..500 {
            if service.get_tally_status(&election_id).unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            service.get_tally_status(&election_id).unwrap().status,
            JobStatus::Completed
        );
    }
}
