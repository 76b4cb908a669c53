//! Task Executor Module
//!
//! A durable, at-least-once task queue and the worker pool that drains it. Every unit of chunk
//! work in the pipeline (tally, partial decryption, compensated decryption, combination) is a
//! [`Task`](types::Task) published here.
//!
//! ## Architecture Overview
//! The executor follows a **Pull-based** model with **Lease** management:
//! 1. **Submission**: Orchestrators publish tasks to the `TaskQueue`, which shards them into
//!    partitions by task ID.
//! 2. **Execution**: Workers claim one task at a time and run the handler registered for its kind.
//! 3. **Leasing**: A claim sets a lease expiration that the worker keeps renewing. If the worker
//!    dies, the lease expires and another worker picks the task up (at-least-once semantics).
//! 4. **Retries**: Transient failures are requeued with backoff; terminal failures trigger the
//!    kind's failure hook so progress tracking can record them.
//!
//! ## Submodules
//! - **`queue`**: Task state, claiming, leases and retry policy.
//! - **`executor`**: The worker pool and the execution lifecycle (claim -> run -> ack/fail).
//! - **`registry`**: Maps task kinds to executable Rust closures.

pub mod executor;
pub mod queue;
pub mod registry;
pub mod types;

pub use executor::{ExecutorConfig, TaskExecutor};
pub use queue::{QueueConfig, TaskQueue};
pub use registry::TaskHandlerRegistry;
pub use types::{Task, TaskEntry, TaskId, TaskKind, TaskStatus};
