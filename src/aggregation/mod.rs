//! Result Aggregation Module
//!
//! Threshold combination of decryption shares, one chunk at a time, and the election-level
//! views built from the chunk results: final per-candidate totals and the
//! ballot -> chunk -> chunk result audit trail.

pub mod aggregator;
pub mod handlers;
pub mod types;

pub use aggregator::ResultAggregator;
pub use types::{AggregatedResult, BallotAssignment, ElectionDecryptionStatus};

#[cfg(test)]
mod tests;
