//! Guardian Decryption Module
//!
//! Per-guardian, per-chunk threshold decryption: direct partial shares first, then backup
//! shares covering every other guardian. At most one run per (election, guardian) is in flight;
//! the guard is a compare-and-set on the guardian's progress row, not a process-local lock.

pub mod handlers;
pub mod orchestrator;
pub mod types;

pub use orchestrator::DecryptionOrchestrator;
pub use types::DecryptionDecision;
