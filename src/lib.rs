//! Chunked Tally and Threshold Decryption Library
//!
//! This library crate defines the modules of the tally pipeline. The binary (`main.rs`) runs a
//! synthetic election through it.
//!
//! ## Architecture Modules
//!
//! - **`chunking`**: splits an election's ballots into randomly assigned, fixed-size chunks.
//! - **`executor`**: the lease-based task queue and worker pool. Every unit of work (tally one
//!   chunk, decrypt one chunk for one guardian, ...) is a task executed in isolation.
//! - **`tally`**: per-chunk homomorphic tallying and the election tally job.
//! - **`decryption`**: per-guardian, two-phase threshold decryption runs.
//! - **`aggregation`**: share combination per chunk and the final election result.
//! - **`progress`**: the status records callers poll.
//! - **`storage`**: partitioned in-memory tables and the on-disk snapshot.
//! - **`engine`**: the seam to the cryptographic engine, plus a mock implementation.
//! - **`service`**: the facade wiring everything together.

pub mod aggregation;
pub mod chunking;
pub mod config;
pub mod decryption;
pub mod engine;
pub mod error;
pub mod executor;
pub mod progress;
pub mod service;
pub mod storage;
pub mod tally;

pub use config::PipelineConfig;
pub use error::{Result, TallyError};
pub use service::TallyService;
