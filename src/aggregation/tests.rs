//! Result Aggregator Tests
//!
//! Threshold enforcement, compensation for absent guardians and the shape of the aggregated
//! result.

#[cfg(test)]
mod tests {
    use crate::config::PipelineConfig;
    use crate::engine::mock::MockEngine;
    use crate::error::TallyError;
    use crate::progress::JobStatus;
    use crate::service::TallyService;
    use crate::storage::types::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn key(guardian: usize) -> Vec<u8> {
        format!("key-share-{}", guardian).into_bytes()
    }

    fn guardian(index: usize) -> GuardianId {
        GuardianId(format!("g{}", index))
    }

    /// Votes cycle alice, alice, bob; carol is registered but never voted for.
    fn vote(i: usize) -> &'static str {
        if i % 3 == 2 { "bob" } else { "alice" }
    }

    async fn tallied_election(
        ballots: usize,
        chunk_size: usize,
        guardians: usize,
        threshold: usize,
    ) -> (Arc<TallyService>, ElectionId) {
        let config = PipelineConfig {
            chunk_size,
            worker_count: 4,
            max_retries: 1,
            retry_backoff_base_ms: 0,
            retry_backoff_max_ms: 0,
            engine_timeout_ms: 2_000,
            lease_ms: 5_000,
            poll_interval_ms: 2,
            task_partitions: 8,
        };
        let service = TallyService::new(config, Arc::new(MockEngine::new())).unwrap();
        let election_id = ElectionId::from("e1");

        service
            .register_election(ElectionSetup {
                election_id: election_id.clone(),
                candidates: vec!["alice".into(), "bob".into(), "carol".into()],
                guardians: (1..=guardians)
                    .map(|i| GuardianRegistration {
                        id: guardian(i),
                        sequence_order: i as u32,
                        key_share: key(i),
                    })
                    .collect(),
                threshold,
            })
            .unwrap();
        for i in 0..ballots {
            service
                .add_ballot(
                    &election_id,
                    BallotId(format!("b{:02}", i)),
                    MockEngine::encrypt_vote(vote(i)),
                )
                .unwrap();
        }

        service.initiate_tally(&election_id).unwrap();
        service.run_until_idle().await;
        (service, election_id)
    }

    async fn decrypt(service: &TallyService, election_id: &ElectionId, index: usize) {
        let decision = service
            .initiate_decryption(election_id, &guardian(index), &key(index))
            .unwrap();
        assert!(decision.is_accepted());
        service.run_until_idle().await;
    }

    // ============================================================
    // TEST 1: Totals
    // ============================================================

    #[tokio::test]
    async fn test_final_counts_equal_sum_of_chunks() {
        // ARRANGE: 11 ballots in chunks of 4 -> sizes 4, 4, 3
        let (service, election_id) = tallied_election(11, 4, 1, 1).await;

        // ACT
        decrypt(&service, &election_id, 1).await;
        let result = service.get_aggregated_result(&election_id).unwrap();

        // ASSERT
        assert_eq!(result.per_chunk_results.len(), 3);
        let ordinals: Vec<u64> = result.per_chunk_results.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);

        let mut summed: BTreeMap<String, u64> = BTreeMap::new();
        for chunk in &result.per_chunk_results {
            for (candidate, count) in &chunk.counts {
                *summed.entry(candidate.clone()).or_insert(0) += count;
            }
        }
        for (candidate, count) in &summed {
            assert_eq!(result.final_counts[candidate], *count);
        }

        let expected_alice = (0..11).filter(|i| vote(*i) == "alice").count() as u64;
        assert_eq!(result.final_counts["alice"], expected_alice);
        assert_eq!(result.final_counts["bob"], 11 - expected_alice);
        // Registered candidate with no votes still reported
        assert_eq!(result.final_counts["carol"], 0);
    }

    #[tokio::test]
    async fn test_every_ballot_is_assigned_to_exactly_one_chunk() {
        let (service, election_id) = tallied_election(11, 4, 1, 1).await;
        decrypt(&service, &election_id, 1).await;

        let result = service.get_aggregated_result(&election_id).unwrap();

        let mut assigned: Vec<BallotId> = result
            .ballot_chunk_assignments
            .iter()
            .map(|a| a.ballot_id.clone())
            .collect();
        assigned.sort();
        let expected: Vec<BallotId> = (0..11).map(|i| BallotId(format!("b{:02}", i))).collect();
        assert_eq!(assigned, expected);

        // Tracking proofs cover each chunk's ballots
        let proofs: usize = result
            .per_chunk_results
            .iter()
            .map(|r| r.tracking_proofs.len())
            .sum();
        assert_eq!(proofs, 11);
        for assignment in &result.ballot_chunk_assignments {
            assert_eq!(
                assignment.chunk_id,
                ChunkId::for_chunk(&election_id, assignment.ordinal)
            );
        }
    }

    #[tokio::test]
    async fn test_results_not_ready_before_combination() {
        let (service, election_id) = tallied_election(5, 2, 1, 1).await;

        let err = service.get_aggregated_result(&election_id).unwrap_err();

        assert_eq!(
            err,
            TallyError::ResultsNotReady {
                combined: 0,
                total: 3
            }
        );
        let status = service.get_election_decryption_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.pending_chunks, 3);
    }

    // ============================================================
    // TEST 2: Threshold
    // ============================================================

    #[tokio::test]
    async fn test_combination_waits_for_threshold() {
        // ARRANGE: 2 guardians, both required
        let (service, election_id) = tallied_election(6, 3, 2, 2).await;

        // ACT: only g1 decrypts
        decrypt(&service, &election_id, 1).await;

        // ASSERT: nothing combined, chunks still retryable, no task counted as failed
        let status = service.get_election_decryption_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::InProgress);
        assert_eq!(status.combined_chunks, 0);
        assert_eq!(service.queue_stats().failed, 0);
        assert!(matches!(
            service.get_aggregated_result(&election_id),
            Err(TallyError::ResultsNotReady { .. })
        ));

        // An explicit combine still cannot succeed
        assert_eq!(service.combine_election(&election_id).unwrap(), 2);
        service.run_until_idle().await;
        assert_eq!(
            service
                .get_election_decryption_status(&election_id)
                .unwrap()
                .combined_chunks,
            0
        );
        assert_eq!(service.queue_stats().failed, 0);

        // ACT: g2 completes, combination is scheduled automatically
        decrypt(&service, &election_id, 2).await;

        // ASSERT
        let status = service.get_election_decryption_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.combined_chunks, 2);
        let result = service.get_aggregated_result(&election_id).unwrap();
        assert_eq!(result.final_counts["alice"] + result.final_counts["bob"], 6);
        for chunk in &result.per_chunk_results {
            assert_eq!(chunk.contributors, vec![guardian(1), guardian(2)]);
        }
        assert_eq!(service.queue_stats().failed, 0);
        assert_eq!(service.queue().task_count(), 0);
    }

    #[tokio::test]
    async fn test_share_from_another_run_is_not_combined() {
        // ARRANGE: 2 chunks, both guardians required; g1 completes
        let (service, election_id) = tallied_election(6, 3, 2, 2).await;
        decrypt(&service, &election_id, 1).await;

        // g1's direct share for chunk 0 is replaced by a row from some other run
        let chunk_0 = ChunkId::for_chunk(&election_id, 0);
        let original = service.store().partial(&chunk_0, &guardian(1)).unwrap();
        service.store().record_partial(
            PartialDecryption {
                run_id: JobId::new(),
                ..original
            },
            |_| true,
        );

        // ACT
        decrypt(&service, &election_id, 2).await;

        // ASSERT: chunk 0 waits, chunk 1 combines
        assert_eq!(
            service.store().chunk(&chunk_0).unwrap().status,
            ChunkStatus::Tallied
        );
        assert!(service.store().chunk_result(&chunk_0).is_none());
        let chunk_1 = ChunkId::for_chunk(&election_id, 1);
        assert_eq!(
            service.store().chunk(&chunk_1).unwrap().status,
            ChunkStatus::Combined
        );
        let status = service.get_election_decryption_status(&election_id).unwrap();
        assert_eq!(status.status, JobStatus::InProgress);
        assert_eq!(status.combined_chunks, 1);
        assert_eq!(service.queue_stats().failed, 0);
    }

    #[tokio::test]
    async fn test_absent_guardian_is_compensated() {
        // ARRANGE: 3 guardians, threshold 2, g3 never shows up
        let (service, election_id) = tallied_election(9, 4, 3, 2).await;

        // ACT
        decrypt(&service, &election_id, 1).await;
        decrypt(&service, &election_id, 2).await;

        // ASSERT
        let result = service.get_aggregated_result(&election_id).unwrap();
        assert_eq!(result.per_chunk_results.len(), 3);
        for chunk in &result.per_chunk_results {
            assert_eq!(chunk.contributors, vec![guardian(1), guardian(2)]);
        }
        assert_eq!(
            result.final_counts.values().sum::<u64>(),
            9,
            "every ballot counted despite the absent guardian"
        );
        // g1 finished first and its combine attempts were acknowledged, not failed
        assert_eq!(service.queue_stats().failed, 0);
    }

    #[tokio::test]
    async fn test_combine_requires_completed_tally() {
        let service =
            TallyService::new(PipelineConfig::default(), Arc::new(MockEngine::new())).unwrap();

        let err = service
            .combine_election(&ElectionId::from("nope"))
            .unwrap_err();
        assert!(matches!(err, TallyError::NotFound { .. }));

        service
            .register_election(ElectionSetup {
                election_id: ElectionId::from("e1"),
                candidates: vec!["alice".into()],
                guardians: vec![GuardianRegistration {
                    id: guardian(1),
                    sequence_order: 1,
                    key_share: key(1),
                }],
                threshold: 1,
            })
            .unwrap();
        let err = service
            .combine_election(&ElectionId::from("e1"))
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidState(_)));
    }
}
