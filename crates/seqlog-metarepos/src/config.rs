//! Metadata repository configuration

use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Metadata repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Cluster identifier reported by `GetClusterInfo`
    pub cluster_id: u32,

    /// Index of this replica in the consensus group
    pub node_index: u64,

    /// Number of non-learner replicas every log stream must have
    pub replication_factor: usize,

    /// Interval between commit rounds proposed by the leader
    pub commit_tick: Duration,

    /// Upper bound for a client request from proposal to apply
    pub request_timeout: Duration,

    /// Applied entries between snapshots
    pub snapshot_threshold: u64,

    /// Directory for snapshot files (in-memory only when unset)
    pub snapshot_dir: Option<PathBuf>,

    /// Number of snapshot files retained
    pub snapshots_to_keep: usize,

    /// Stripes of the per-log-stream status lock
    pub log_stream_lock_shards: usize,

    /// Capacity of the queue between the collector and the ticker
    pub report_queue_capacity: usize,

    /// Report collector settings
    pub collector: CollectorConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cluster_id: 1,
            node_index: 1,
            replication_factor: 1,
            commit_tick: Duration::from_millis(1),
            request_timeout: Duration::from_secs(3),
            snapshot_threshold: 10000,
            snapshot_dir: None,
            snapshots_to_keep: 3,
            log_stream_lock_shards: 256,
            report_queue_capacity: 1024,
            collector: CollectorConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Create configuration builder
    pub fn builder() -> RepositoryConfigBuilder {
        RepositoryConfigBuilder::new()
    }

    /// Reject settings the repository cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(RepositoryError::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.commit_tick.is_zero() {
            return Err(RepositoryError::InvalidConfig(
                "commit_tick must be non-zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RepositoryError::InvalidConfig(
                "request_timeout must be non-zero".into(),
            ));
        }
        if self.snapshot_threshold == 0 {
            return Err(RepositoryError::InvalidConfig(
                "snapshot_threshold must be at least 1".into(),
            ));
        }
        if self.snapshots_to_keep == 0 {
            return Err(RepositoryError::InvalidConfig(
                "snapshots_to_keep must be at least 1".into(),
            ));
        }
        if self.log_stream_lock_shards == 0 {
            return Err(RepositoryError::InvalidConfig(
                "log_stream_lock_shards must be at least 1".into(),
            ));
        }
        if self.report_queue_capacity == 0 {
            return Err(RepositoryError::InvalidConfig(
                "report_queue_capacity must be at least 1".into(),
            ));
        }
        self.collector.validate()
    }
}

/// Builder for repository configuration
#[derive(Debug, Default)]
pub struct RepositoryConfigBuilder {
    cluster_id: Option<u32>,
    node_index: Option<u64>,
    replication_factor: Option<usize>,
    commit_tick: Option<Duration>,
    request_timeout: Option<Duration>,
    snapshot_threshold: Option<u64>,
    snapshot_dir: Option<PathBuf>,
    log_stream_lock_shards: Option<usize>,
    collector: Option<CollectorConfig>,
}

impl RepositoryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_id(mut self, id: u32) -> Self {
        self.cluster_id = Some(id);
        self
    }

    pub fn node_index(mut self, index: u64) -> Self {
        self.node_index = Some(index);
        self
    }

    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = Some(factor);
        self
    }

    pub fn commit_tick(mut self, tick: Duration) -> Self {
        self.commit_tick = Some(tick);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.snapshot_threshold = Some(entries);
        self
    }

    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    pub fn log_stream_lock_shards(mut self, shards: usize) -> Self {
        self.log_stream_lock_shards = Some(shards);
        self
    }

    pub fn collector(mut self, config: CollectorConfig) -> Self {
        self.collector = Some(config);
        self
    }

    pub fn build(self) -> RepositoryConfig {
        let defaults = RepositoryConfig::default();
        RepositoryConfig {
            cluster_id: self.cluster_id.unwrap_or(defaults.cluster_id),
            node_index: self.node_index.unwrap_or(defaults.node_index),
            replication_factor: self
                .replication_factor
                .unwrap_or(defaults.replication_factor),
            commit_tick: self.commit_tick.unwrap_or(defaults.commit_tick),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            snapshot_threshold: self
                .snapshot_threshold
                .unwrap_or(defaults.snapshot_threshold),
            snapshot_dir: self.snapshot_dir,
            snapshots_to_keep: defaults.snapshots_to_keep,
            log_stream_lock_shards: self
                .log_stream_lock_shards
                .unwrap_or(defaults.log_stream_lock_shards),
            report_queue_capacity: defaults.report_queue_capacity,
            collector: self.collector.unwrap_or_default(),
        }
    }
}

/// Report collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Interval between `GetReport` polls of one storage node
    pub report_interval: Duration,

    /// Timeout of a single storage node RPC
    pub rpc_timeout: Duration,

    /// First retry delay after a failed RPC
    pub retry_backoff_min: Duration,

    /// Cap of the retry delay
    pub retry_backoff_max: Duration,

    /// Time without a successful report before a node is flagged stale
    pub staleness_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_millis(10),
            rpc_timeout: Duration::from_secs(1),
            retry_backoff_min: Duration::from_millis(10),
            retry_backoff_max: Duration::from_secs(1),
            staleness_timeout: Duration::from_secs(10),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.report_interval.is_zero() {
            return Err(RepositoryError::InvalidConfig(
                "collector.report_interval must be non-zero".into(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(RepositoryError::InvalidConfig(
                "collector.rpc_timeout must be non-zero".into(),
            ));
        }
        if self.retry_backoff_min > self.retry_backoff_max {
            return Err(RepositoryError::InvalidConfig(format!(
                "collector.retry_backoff_min {:?} exceeds retry_backoff_max {:?}",
                self.retry_backoff_min, self.retry_backoff_max
            )));
        }
        Ok(())
    }
}
