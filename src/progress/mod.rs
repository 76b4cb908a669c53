//! Progress Tracking
//!
//! Durable status records that callers poll while the pipeline runs in the background.
//!
//! ## Responsibilities
//! - **Tally jobs**: one record per election with processed/failed chunk counters and a total
//!   fixed at job creation. `COMPLETED` is declared only when the processed counter reaches
//!   that total.
//! - **Decryption runs**: one record per (election, guardian), walking through
//!   `PartialDecryption -> CompensatedShares -> Completed`. Each run carries a `run_id`; work
//!   belonging to an older run is ignored.
//! - **Concurrency**: every transition is a compare-and-set on the row, so two callers racing
//!   to start the same run converge on one record.

pub mod tracker;
pub mod types;

pub use tracker::{ProgressSnapshot, ProgressTracker};
pub use types::{
    CountedUnits, DecryptionBegin, DecryptionPhase, DecryptionProgress, DecryptionStatusView, JobStatus,
    TallyInit, TallyProgress, TallyStatusView,
};
