//! Cryptographic Tally Engine Seam
//!
//! The pipeline never performs cryptography itself. Homomorphic tallying, partial decryption,
//! compensated (backup) decryption and share combination are delegated to an implementation
//! of [`TallyEngine`]. Blobs passed across this boundary are opaque bytes.
//!
//! Every call made by the orchestrators goes through [`call_with_timeout`], which bounds the
//! call and turns an elapsed deadline into a retryable [`TallyError::Transient`].
//!
//! # Implementations
//!
//! - [`mock::MockEngine`]: transparent, deterministic engine with fault injection, used by the
//!   test suite and the demo binary.

pub mod mock;

use crate::error::{Result, TallyError};
use crate::storage::types::{BallotId, GuardianId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by engine calls, borrowing the call's inputs.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A ballot's ciphertext as handed to the engine for tallying.
#[derive(Debug, Clone, PartialEq)]
pub struct BallotCiphertext {
    pub ballot_id: BallotId,
    pub ciphertext: Vec<u8>,
}

/// One contribution towards decrypting a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptionShare {
    Direct {
        guardian_id: GuardianId,
        share: Vec<u8>,
    },
    Compensated {
        compensating_guardian_id: GuardianId,
        missing_guardian_id: GuardianId,
        share: Vec<u8>,
    },
}

/// Evidence that a ballot was included in a decrypted chunk tally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BallotTrackingProof {
    pub ballot_id: BallotId,
    pub proof: Vec<u8>,
}

/// Output of combining a chunk's shares.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedTally {
    pub counts: BTreeMap<String, u64>,
    pub tracking_proofs: Vec<BallotTrackingProof>,
}

/// The external cryptographic collaborator.
///
/// Implementations signal retryable conditions (timeouts, unavailability) with
/// [`TallyError::Transient`] and bad input (malformed ciphertext, rejected shares) with
/// [`TallyError::Permanent`].
pub trait TallyEngine: Send + Sync {
    /// Homomorphically accumulates ciphertexts into one encrypted tally blob.
    fn tally<'a>(&'a self, ciphertexts: &'a [BallotCiphertext]) -> EngineFuture<'a, Vec<u8>>;

    /// A guardian's direct decryption share for an encrypted tally.
    fn partial_decrypt<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        guardian_key_share: &'a [u8],
    ) -> EngineFuture<'a, Vec<u8>>;

    /// A present guardian's backup share standing in for `missing_guardian_id`.
    fn compensated_decrypt<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        present_guardian_key_share: &'a [u8],
        missing_guardian_id: &'a GuardianId,
    ) -> EngineFuture<'a, Vec<u8>>;

    /// Reconstructs the plaintext tally from direct and compensated shares.
    fn combine<'a>(
        &'a self,
        encrypted_tally: &'a [u8],
        shares: &'a [DecryptionShare],
    ) -> EngineFuture<'a, CombinedTally>;
}

/// Runs an engine call under a deadline.
pub async fn call_with_timeout<T>(
    timeout: Duration,
    operation: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Engine {} timed out after {:?}", operation, timeout);
            Err(TallyError::Transient(format!(
                "engine {} timed out after {} ms",
                operation,
                timeout.as_millis()
            )))
        }
    }
}
