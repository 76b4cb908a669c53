//! Chunk Partitioner Tests
//!
//! Covers the partition properties the rest of the pipeline relies on: chunk count,
//! disjointness, exhaustiveness and rejection of a zero chunk size.

#[cfg(test)]
mod tests {
    use crate::chunking::{chunk_count, partition_ballots, partition_ballots_with_rng};
    use crate::error::TallyError;
    use crate::storage::types::{BallotId, ChunkStatus, ElectionId};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn ballots(n: usize) -> Vec<BallotId> {
        (0..n).map(|i| BallotId(format!("ballot-{}", i))).collect()
    }

    // ============================================================
    // PARTITION PROPERTIES
    // ============================================================

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(chunk_count(0, 4), 0);
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(11, 4), 3);
        assert_eq!(chunk_count(12, 4), 3);
        assert_eq!(chunk_count(13, 4), 4);
    }

    #[test]
    fn test_partition_is_disjoint_and_exhaustive() {
        let election = ElectionId::from("e1");
        let mut rng = StdRng::seed_from_u64(7);

        for n in [0usize, 1, 2, 5, 11, 64, 257] {
            for size in [1usize, 3, 4, 10, 300] {
                let input = ballots(n);
                let plan = partition_ballots_with_rng(&election, &input, size, &mut rng).unwrap();

                assert_eq!(plan.chunks.len(), chunk_count(n, size), "n={} size={}", n, size);

                let mut seen = HashSet::new();
                for chunk in &plan.chunks {
                    assert!(chunk.ballot_ids.len() <= size);
                    assert!(!chunk.ballot_ids.is_empty());
                    for ballot in &chunk.ballot_ids {
                        assert!(seen.insert(ballot.clone()), "ballot {} in two chunks", ballot);
                    }
                }
                let expected: HashSet<_> = input.into_iter().collect();
                assert_eq!(seen, expected);
                assert_eq!(plan.assignments.len(), n);
            }
        }
    }

    #[test]
    fn test_eleven_ballots_in_chunks_of_four() {
        let plan = partition_ballots(&ElectionId::from("e1"), &ballots(11), 4).unwrap();

        let sizes: Vec<usize> = plan.chunks.iter().map(|c| c.ballot_ids.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);

        let ordinals: Vec<u64> = plan.chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert!(plan.chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert_eq!(plan.chunks[2].id.0, "e1#2");
    }

    #[test]
    fn test_assignments_match_chunk_membership() {
        let plan = partition_ballots(&ElectionId::from("e1"), &ballots(20), 6).unwrap();

        for (ballot, chunk_id) in &plan.assignments {
            let chunk = plan.chunks.iter().find(|c| &c.id == chunk_id).unwrap();
            assert!(chunk.ballot_ids.contains(ballot));
        }
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = partition_ballots(&ElectionId::from("e1"), &ballots(3), 0);
        assert!(matches!(result, Err(TallyError::Validation(_))));
    }

    #[test]
    fn test_assignment_is_shuffled() {
        // With 200 ballots in chunks of 10, an identity assignment is astronomically unlikely.
        let input = ballots(200);
        let mut rng = StdRng::seed_from_u64(99);
        let plan = partition_ballots_with_rng(&ElectionId::from("e1"), &input, 10, &mut rng).unwrap();

        let flattened: Vec<BallotId> = plan
            .chunks
            .iter()
            .flat_map(|c| c.ballot_ids.iter().cloned())
            .collect();
        assert_ne!(flattened, input);
    }
}
