//! Configuration for the tally pipeline.

use crate::error::{Result, TallyError};
use crate::executor::{ExecutorConfig, QueueConfig};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration. Every field has a default, so an empty TOML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Ballots per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Concurrent task workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Deadline for a single engine call
    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,

    /// Task lease; renewed every third of this while a task runs
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Idle sleep between queue polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Partitions per table
    #[serde(default = "default_task_partitions")]
    pub task_partitions: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            engine_timeout_ms: default_engine_timeout_ms(),
            lease_ms: default_lease_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            task_partitions: default_task_partitions(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TallyError::Validation("chunk_size must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(TallyError::Validation("worker_count must be > 0".into()));
        }
        if self.engine_timeout_ms == 0 {
            return Err(TallyError::Validation("engine_timeout_ms must be > 0".into()));
        }
        if self.lease_ms == 0 {
            return Err(TallyError::Validation("lease_ms must be > 0".into()));
        }
        if self.task_partitions == 0 {
            return Err(TallyError::Validation("task_partitions must be > 0".into()));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(TallyError::Validation(format!(
                "retry_backoff_max_ms ({}) must be >= retry_backoff_base_ms ({})",
                self.retry_backoff_max_ms, self.retry_backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            partitions: self.task_partitions,
            lease_ms: self.lease_ms,
            max_retries: self.max_retries,
            backoff_base_ms: self.retry_backoff_base_ms,
            backoff_max_ms: self.retry_backoff_max_ms,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            worker_count: self.worker_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_renewal_interval: Duration::from_millis((self.lease_ms / 3).max(1)),
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }
}

// Default value functions for serde

fn default_chunk_size() -> usize {
    100
}

fn default_worker_count() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_base_ms() -> u64 {
    200
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_engine_timeout_ms() -> u64 {
    30_000
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_task_partitions() -> u32 {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.chunk_size, 100);
        assert_eq!(
            config.executor_config().lease_renewal_interval,
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = PipelineConfig::from_toml(
            r#"
            chunk_size = 25
            worker_count = 8
            engine_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.engine_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(PipelineConfig::from_toml("chunk_size = 0").is_err());
        assert!(
            PipelineConfig::from_toml("retry_backoff_base_ms = 500\nretry_backoff_max_ms = 100")
                .is_err()
        );
        assert!(PipelineConfig::from_toml("unknown_key = 1").is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "worker_count = 2\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.worker_count, 2);

        let missing = dir.path().join("missing.toml");
        let err = PipelineConfig::from_file(&missing).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));
    }
}
