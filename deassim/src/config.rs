use crate::error::{DeassimError, DeassimResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Scalars consumed by one replication run.
///
/// Mounting the share and the volume happens elsewhere; by the time this is
/// built both roots are plain local directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    /// Worker ceiling W: maximum queued-or-in-flight directory jobs
    pub workers: usize,
    /// Force W=1 for deterministic diagnosis
    pub single_worker: bool,
    /// Collect per-directory reports
    pub statistics: bool,
    /// Print run totals at the end
    pub totals: bool,
    /// Run the size-only comparison after the replication
    pub verify: bool,
    pub block_size: usize,
    pub status_channel_capacity: usize,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("/mnt/deassim/share"),
            target_root: PathBuf::from("/mnt/deassim/vol"),
            workers: 50,
            single_worker: false,
            statistics: false,
            totals: false,
            verify: false,
            block_size: 1024 * 1024, // 1MB
            status_channel_capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_single_worker(mut self, single_worker: bool) -> Self {
        self.single_worker = single_worker;
        self
    }

    pub fn with_statistics(mut self, statistics: bool) -> Self {
        self.statistics = statistics;
        self
    }

    /// The ceiling actually enforced by the pool
    pub fn effective_workers(&self) -> usize {
        if self.single_worker {
            1
        } else {
            self.workers
        }
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> DeassimResult<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var("DEASSIM_CONFIG_PATH")
                    .unwrap_or_else(|_| "/etc/deassim/config.toml".to_string()),
            ),
        };

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => Self::from_toml(&content),
            Err(_) => {
                warn!("Configuration file not found at {:?}. Using default settings.", config_path);
                Ok(Self::default())
            }
        }
    }

    pub fn from_toml(content: &str) -> DeassimResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> DeassimResult<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "worker ceiling must be at least 1"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size", "block size must be greater than zero"));
        }
        if self.status_channel_capacity == 0 {
            return Err(invalid("status_channel_capacity", "channel capacity must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "at least one attempt is required"));
        }
        if self.source_root == self.target_root {
            return Err(invalid("target_root", "source and target roots are the same"));
        }
        if self.target_root.starts_with(&self.source_root) {
            return Err(invalid("target_root", "target root lies inside the source tree"));
        }
        if self.source_root.starts_with(&self.target_root) {
            return Err(invalid("source_root", "source root lies inside the target tree"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> DeassimError {
    DeassimError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
