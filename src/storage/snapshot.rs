//! Durable Snapshot
//!
//! Point-in-time copy of every persisted table (store, progress records, task queue), encoded
//! with bincode. Restoring a snapshot into a fresh service resumes the pipeline: tasks that
//! were in flight keep their lease, which expires normally, and are then redelivered.
//!
//! Guardian key shares are not part of the snapshot.

use super::store::StoreSnapshot;
use crate::error::Result;
use crate::executor::types::{TaskEntry, TaskId};
use crate::progress::ProgressSnapshot;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Bumped whenever the encoded layout changes.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub store: StoreSnapshot,
    pub progress: ProgressSnapshot,
    pub tasks: Vec<(TaskId, TaskEntry)>,
}

impl StateSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        tracing::info!(
            "Saved snapshot to {} ({} tasks)",
            path.display(),
            self.tasks.len()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: StateSnapshot = bincode::deserialize_from(reader)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(crate::error::TallyError::Storage(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        tracing::info!("Loaded snapshot from {}", path.display());
        Ok(snapshot)
    }
}
