//! Chunked Tally Module
//!
//! Drives the per-chunk homomorphic tally. Election-level status is `PENDING` until the first
//! chunk starts, `IN_PROGRESS` while any chunk is unfinished, `COMPLETED` once every chunk is
//! tallied and `FAILED` if any chunk failed terminally.

pub mod handlers;
pub mod orchestrator;

pub use orchestrator::TallyOrchestrator;
