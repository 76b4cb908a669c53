//! Storage Module
//!
//! The persisted state of the pipeline, held in partitioned in-memory tables.
//!
//! ## Core Concepts
//! - **Partitioning**: every table is split into fixed partitions by key hash (`Partitioner`),
//!   each backed by its own concurrent map (`PartitionedMap`).
//! - **Compare-and-set**: state transitions are closures run under the row's lock, so workers
//!   racing on the same row serialize without process-wide locks.
//! - **Tables**: `TallyStore` owns elections, ballots, chunks, decryption shares and chunk
//!   results.
//! - **Durability**: `StateSnapshot` writes every table to disk with bincode and restores it.

pub mod memory;
pub mod partitioner;
pub mod snapshot;
pub mod store;
pub mod types;

pub use snapshot::StateSnapshot;
pub use store::TallyStore;
