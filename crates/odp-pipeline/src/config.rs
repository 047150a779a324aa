//! Pipeline configuration
//!
//! Loaded from `ODP_*` environment variables; every knob has a default
//! that works for a local dry run against the in-memory backends.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upstream feed connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Feed name, used as the first routing-key segment and the catalog
    /// dataset column
    pub dataset: String,
    /// FTP server hostname
    pub host: String,
    /// FTP server port
    pub port: u16,
    /// FTP username
    pub username: String,
    /// FTP password
    pub password: String,
    /// Remote directory holding the snapshot archive
    pub remote_dir: String,
    /// Snapshot archive filename inside the remote directory
    pub archive_name: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dataset: "gtfs".to_string(),
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "anonymous@example.com".to_string(),
            remote_dir: "/".to_string(),
            archive_name: "gtfs.zip".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            dataset: std::env::var("ODP_DATASET").unwrap_or(defaults.dataset),
            host: std::env::var("ODP_FTP_HOST").unwrap_or(defaults.host),
            port: std::env::var("ODP_FTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            username: std::env::var("ODP_FTP_USERNAME").unwrap_or(defaults.username),
            password: std::env::var("ODP_FTP_PASSWORD").unwrap_or(defaults.password),
            remote_dir: std::env::var("ODP_FTP_DIR").unwrap_or(defaults.remote_dir),
            archive_name: std::env::var("ODP_FTP_ARCHIVE").unwrap_or(defaults.archive_name),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dataset.is_empty() {
            anyhow::bail!("ODP_DATASET cannot be empty");
        }
        if self.dataset.contains('.') {
            anyhow::bail!("ODP_DATASET cannot contain '.', it is a routing-key segment");
        }
        if self.host.is_empty() {
            anyhow::bail!("ODP_FTP_HOST cannot be empty");
        }
        if self.archive_name.is_empty() {
            anyhow::bail!("ODP_FTP_ARCHIVE cannot be empty");
        }
        Ok(())
    }
}

/// Completion barrier tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierConfig {
    /// Delay between self-requeued completion polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Polls after which verification runs even on an incomplete drain,
    /// so a lost chunk ends as a rejected run instead of an eternal poll
    pub max_attempts: u32,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_attempts: 900,
        }
    }
}

impl BarrierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Middle routing-key segment shared by all queues
    pub queue_prefix: String,
    /// Rows per chunk message
    pub chunk_size: usize,
    /// Concurrent consumers on the transform queue
    pub transform_consumers: usize,
    /// Concurrent consumers on the load queue
    pub load_consumers: usize,
    /// TTL for chunk messages, seconds; expired chunks are dead-lettered
    pub message_ttl_secs: u64,
    /// Scratch directory for decompressed snapshot files
    pub work_dir: PathBuf,
    /// Completion barrier tuning
    pub barrier: BarrierConfig,
    /// Upstream feed settings
    pub source: SourceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "odp".to_string(),
            chunk_size: 1_000,
            transform_consumers: 2,
            load_consumers: 4,
            message_ttl_secs: 3_600,
            work_dir: std::env::temp_dir().join("odp-import"),
            barrier: BarrierConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `ODP_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            queue_prefix: std::env::var("ODP_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            chunk_size: std::env::var("ODP_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.chunk_size),
            transform_consumers: std::env::var("ODP_TRANSFORM_CONSUMERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.transform_consumers),
            load_consumers: std::env::var("ODP_LOAD_CONSUMERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.load_consumers),
            message_ttl_secs: std::env::var("ODP_MESSAGE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.message_ttl_secs),
            work_dir: std::env::var("ODP_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            barrier: BarrierConfig {
                poll_interval_ms: std::env::var("ODP_BARRIER_POLL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.barrier.poll_interval_ms),
                max_attempts: std::env::var("ODP_BARRIER_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.barrier.max_attempts),
            },
            source: SourceConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_prefix.is_empty() || self.queue_prefix.contains('.') {
            anyhow::bail!("ODP_QUEUE_PREFIX must be a single routing-key segment");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("ODP_CHUNK_SIZE must be greater than 0");
        }
        if self.transform_consumers == 0 || self.load_consumers == 0 {
            anyhow::bail!("consumer counts must be greater than 0");
        }
        if self.barrier.max_attempts == 0 {
            anyhow::bail!("ODP_BARRIER_MAX_ATTEMPTS must be greater than 0");
        }
        self.source.validate()?;
        Ok(())
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        (self.message_ttl_secs > 0).then(|| Duration::from_secs(self.message_ttl_secs))
    }
}
