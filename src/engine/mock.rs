//! Mock tally engine for testing
//!
//! A transparent stand-in for the cryptographic engine. "Ciphertexts" are JSON-encoded votes,
//! the "encrypted tally" is a JSON document with per-candidate counts, and shares are SHA3
//! digests binding a key share to the tally. Nothing here is secret; the point is to exercise
//! the pipeline deterministically.
//!
//! # Features
//!
//! - Per-ballot fault injection on `tally` (fail N times, or fail permanently)
//! - Simulated unavailability and latency (for timeout handling)
//! - Call counters for every engine operation

use super::{BallotCiphertext, BallotTrackingProof, CombinedTally, DecryptionShare, EngineFuture, TallyEngine};
use crate::error::{Result, TallyError};
use crate::storage::types::{BallotId, GuardianId};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Failure behaviour injected for a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient error this many more times, then succeed.
    Transient { remaining: u32 },
    /// Always fail with a permanent error.
    Permanent,
}

#[derive(Debug, Serialize, Deserialize)]
struct MockVote {
    candidate: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MockTally {
    counts: BTreeMap<String, u64>,
    ballot_ids: Vec<BallotId>,
}

#[derive(Default)]
pub struct MockEngine {
    tally_faults: DashMap<BallotId, Fault>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    tally_calls: AtomicUsize,
    partial_calls: AtomicUsize,
    compensated_calls: AtomicUsize,
    combine_calls: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces a mock ciphertext for a vote.
    pub fn encrypt_vote(candidate: &str) -> Vec<u8> {
        serde_json::to_vec(&MockVote {
            candidate: candidate.to_string(),
        })
        .unwrap_or_default()
    }

    /// Makes `tally` fail transiently `times` times for any chunk containing `ballot_id`.
    pub fn fail_tally_transiently(&self, ballot_id: &BallotId, times: u32) {
        self.set_fault(ballot_id, Fault::Transient { remaining: times });
    }

    /// Makes `tally` fail permanently for any chunk containing `ballot_id`.
    pub fn fail_tally_permanently(&self, ballot_id: &BallotId) {
        self.set_fault(ballot_id, Fault::Permanent);
    }

    pub fn clear_faults(&self) {
        self.tally_faults.clear();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn tally_calls(&self) -> usize {
        self.tally_calls.load(Ordering::SeqCst)
    }

    pub fn partial_calls(&self) -> usize {
        self.partial_calls.load(Ordering::SeqCst)
    }

    pub fn compensated_calls(&self) -> usize {
        self.compensated_calls.load(Ordering::SeqCst)
    }

    pub fn combine_calls(&self) -> usize {
        self.combine_calls.load(Ordering::SeqCst)
    }

    fn set_fault(&self, ballot_id: &BallotId, fault: Fault) {
        self.tally_faults.insert(ballot_id.clone(), fault);
    }

    async fn simulate_conditions(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TallyError::Transient("engine unavailable".into()));
        }
        Ok(())
    }

    fn check_tally_faults(&self, ciphertexts: &[BallotCiphertext]) -> Result<()> {
        for ciphertext in ciphertexts {
            // Budget is decremented under the entry guard.
            let Some(mut fault) = self.tally_faults.get_mut(&ciphertext.ballot_id) else {
                continue;
            };
            match fault.value_mut() {
                Fault::Permanent => {
                    return Err(TallyError::Permanent(format!(
                        "engine rejected ballot {}",
                        ciphertext.ballot_id
                    )));
                }
                Fault::Transient { remaining } if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(TallyError::Transient(format!(
                        "injected transient failure for ballot {}",
                        ciphertext.ballot_id
                    )));
                }
                Fault::Transient { .. } => {}
            }
        }
        Ok(())
    }

    fn decode_tally(encrypted_tally: &[u8]) -> Result<MockTally> {
        serde_json::from_slice(encrypted_tally)
            .map_err(|e| TallyError::Permanent(format!("malformed encrypted tally: {}", e)))
    }
}

fn digest(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

impl TallyEngine for MockEngine {
    fn tally<'a>(&'a self, ciphertexts: &'a [BallotCiphertext]) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.tally_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_conditions().await?;
            self.check_tally_faults(ciphertexts)?;

            let mut counts = BTreeMap::new();
            let mut ballot_ids = Vec::with_capacity(ciphertexts.len());
            for ciphertext in ciphertexts {
                let vote: MockVote = serde_json::from_slice(&ciphertext.ciphertext).map_err(|e| {
                    TallyError::Permanent(format!(
                        "malformed ciphertext for ballot {}: {}",
                        ciphertext.ballot_id, e
                    ))
                })?;
                *counts.entry(vote.candidate).or_insert(0) += 1;
                ballot_ids.push(ciphertext.ballot_id.clone());
            }

            serde_json::to_vec(&MockTally { counts, ballot_ids })
                .map_err(|e| TallyError::Permanent(e.to_string()))
        })
    }

    fn partial_decrypt<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        guardian_key_share: &'a [u8],
    ) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.partial_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_conditions().await?;
            Self::decode_tally(encrypted_tally)?;
            Ok(digest(&[b"partial", guardian_key_share, encrypted_tally]))
        })
    }

    fn compensated_decrypt<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        present_guardian_key_share: &'a [u8],
        missing_guardian_id: &'a GuardianId,
    ) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.compensated_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_conditions().await?;
            Self::decode_tally(encrypted_tally)?;
            Ok(digest(&[
                b"compensated",
                present_guardian_key_share,
                missing_guardian_id.0.as_bytes(),
                encrypted_tally,
            ]))
        })
    }

    fn combine<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        shares: &'a [DecryptionShare],
    ) -> EngineFuture<'a, CombinedTally> {
        Box::pin(async move {
            self.combine_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_conditions().await?;

            if shares.is_empty() {
                return Err(TallyError::Permanent("no decryption shares supplied".into()));
            }
            let empty_share = shares.iter().any(|share| match share {
                DecryptionShare::Direct { share, .. } => share.is_empty(),
                DecryptionShare::Compensated { share, .. } => share.is_empty(),
            });
            if empty_share {
                return Err(TallyError::Permanent("empty decryption share".into()));
            }

            let tally = Self::decode_tally(encrypted_tally)?;
            let tracking_proofs = tally
                .ballot_ids
                .iter()
                .map(|ballot_id| BallotTrackingProof {
                    ballot_id: ballot_id.clone(),
                    proof: digest(&[b"proof", ballot_id.0.as_bytes(), encrypted_tally]),
                })
                .collect();

            Ok(CombinedTally {
                counts: tally.counts,
                tracking_proofs,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphertexts(votes: &[(&str, &str)]) -> Vec<BallotCiphertext> {
        votes
            .iter()
            .map(|(ballot, candidate)| BallotCiphertext {
                ballot_id: BallotId::from(*ballot),
                ciphertext: MockEngine::encrypt_vote(candidate),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tally_then_combine_recovers_counts() {
        let engine = MockEngine::new();
        let input = ciphertexts(&[("b1", "alice"), ("b2", "bob"), ("b3", "alice")]);

        let blob = engine.tally(&input).await.unwrap();
        let share = engine.partial_decrypt(&blob, b"key-1").await.unwrap();
        let combined = engine
            .combine(
                &blob,
                &[DecryptionShare::Direct {
                    guardian_id: GuardianId::from("g1"),
                    share,
                }],
            )
            .await
            .unwrap();

        assert_eq!(combined.counts["alice"], 2);
        assert_eq!(combined.counts["bob"], 1);
        assert_eq!(combined.tracking_proofs.len(), 3);
        assert_eq!(engine.tally_calls(), 1);
        assert_eq!(engine.combine_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_fault_clears_after_budget() {
        let engine = MockEngine::new();
        let input = ciphertexts(&[("b1", "alice")]);
        engine.fail_tally_transiently(&BallotId::from("b1"), 2);

        assert!(engine.tally(&input).await.unwrap_err().is_transient());
        assert!(engine.tally(&input).await.unwrap_err().is_transient());
        assert!(engine.tally(&input).await.is_ok());
        assert_eq!(engine.tally_calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_budget_is_shared_by_concurrent_calls() {
        // ARRANGE: 8 chunks racing on the same faulty ballot, budget of 3 failures
        let engine = std::sync::Arc::new(MockEngine::new());
        engine.fail_tally_transiently(&BallotId::from("b1"), 3);

        // ACT
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let other = format!("x{}", i);
                    let input = ciphertexts(&[("b1", "alice"), (other.as_str(), "bob")]);
                    engine.tally(&input).await
                })
            })
            .collect();
        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failures += 1;
            }
        }

        // ASSERT: the budget is spent exactly once, then the fault is cleared
        assert_eq!(failures, 3);
        engine.fail_tally_permanently(&BallotId::from("b1"));
        engine.clear_faults();
        assert!(engine.tally(&ciphertexts(&[("b1", "alice")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_ciphertext_is_permanent() {
        let engine = MockEngine::new();
        let input = vec![BallotCiphertext {
            ballot_id: BallotId::from("b1"),
            ciphertext: b"not json".to_vec(),
        }];

        let err = engine.tally(&input).await.unwrap_err();
        assert!(matches!(err, TallyError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_shares_differ_per_guardian_and_missing_guardian() {
        let engine = MockEngine::new();
        let blob = engine.tally(&ciphertexts(&[("b1", "alice")])).await.unwrap();

        let a = engine.partial_decrypt(&blob, b"key-a").await.unwrap();
        let b = engine.partial_decrypt(&blob, b"key-b").await.unwrap();
        assert_ne!(a, b);

        let for_g2 = engine
            .compensated_decrypt(&blob, b"key-a", &GuardianId::from("g2"))
            .await
            .unwrap();
        let for_g3 = engine
            .compensated_decrypt(&blob, b"key-a", &GuardianId::from("g3"))
            .await
            .unwrap();
        assert_ne!(for_g2, for_g3);
    }

    #[tokio::test]
    async fn test_unavailable_engine_is_transient() {
        let engine = MockEngine::new();
        engine.set_unavailable(true);

        let err = engine.tally(&ciphertexts(&[("b1", "alice")])).await.unwrap_err();
        assert!(err.is_transient());
    }
}
