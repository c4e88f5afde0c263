//! Snapshots of the replicated state
//!
//! A snapshot captures the whole [`ClusterMetadata`] (registries, reports,
//! commit history, peers) together with the log index it reflects. On
//! restart a replica installs the latest snapshot and replays the log from
//! the following index.

use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, Result};
use crate::metadata::ClusterMetadata;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum accepted snapshot size (256 MiB)
pub const MAX_SNAPSHOT_SIZE: usize = 256 * 1024 * 1024;

/// Serialized state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub applied_index: u64,
    pub metadata: ClusterMetadata,
}

impl SnapshotData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = postcard::to_allocvec(self)?;
        if data.len() > MAX_SNAPSHOT_SIZE {
            return Err(RepositoryError::Storage(format!(
                "snapshot too large: {} bytes > {} byte limit",
                data.len(),
                MAX_SNAPSHOT_SIZE
            )));
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| RepositoryError::CorruptData(e.to_string()))
    }
}

/// Where snapshots are persisted
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &SnapshotData) -> Result<()>;

    async fn load_latest(&self) -> Result<Option<SnapshotData>>;
}

/// Keeps the latest snapshot in memory (tests, ephemeral replicas)
#[derive(Default)]
pub struct MemorySnapshotStore {
    latest: Mutex<Option<Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &SnapshotData) -> Result<()> {
        let data = snapshot.encode()?;
        *self.latest.lock() = Some(data);
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<SnapshotData>> {
        let data = self.latest.lock().clone();
        data.map(|d| SnapshotData::decode(&d)).transpose()
    }
}

/// Snapshot files named `snapshot-{index}.snap` in one directory
pub struct FileSnapshotStore {
    dir: PathBuf,
    keep: usize,
}

impl FileSnapshotStore {
    pub async fn open(dir: impl Into<PathBuf>, keep: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            keep: keep.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files sorted by index, oldest first
    async fn list(&self) -> Vec<(u64, PathBuf)> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut snaps = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snap") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if let Some(idx) = stem
                .strip_prefix("snapshot-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                snaps.push((idx, path));
            }
        }
        snaps.sort_by_key(|(idx, _)| *idx);
        snaps
    }

    async fn cleanup_old_snapshots(&self) {
        let snaps = self.list().await;
        if snaps.len() <= self.keep {
            return;
        }

        let to_remove = snaps.len() - self.keep;
        for (_, path) in snaps.into_iter().take(to_remove) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old snapshot");
            } else {
                debug!(path = %path.display(), "Removed old snapshot file");
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &SnapshotData) -> Result<()> {
        let data = snapshot.encode()?;
        let name = format!("snapshot-{}", snapshot.applied_index);

        // temp file → rename
        let snap_path = self.dir.join(format!("{}.snap", name));
        let tmp_path = self.dir.join(format!("{}.snap.tmp", name));
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &snap_path).await?;

        self.cleanup_old_snapshots().await;

        info!(
            applied_index = snapshot.applied_index,
            size_bytes = data.len(),
            path = %snap_path.display(),
            "Created snapshot file"
        );
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<SnapshotData>> {
        let Some((_, path)) = self.list().await.pop() else {
            debug!("No snapshot files found in {}", self.dir.display());
            return Ok(None);
        };

        let data = tokio::fs::read(&path).await?;
        let snapshot = SnapshotData::decode(&data)?;
        info!(
            applied_index = snapshot.applied_index,
            size_bytes = data.len(),
            path = %path.display(),
            "Loaded snapshot file"
        );
        Ok(Some(snapshot))
    }
}

/// Snapshot store selected by `snapshot_dir` (in memory when unset)
pub async fn open_snapshot_store(config: &RepositoryConfig) -> Result<Arc<dyn SnapshotStore>> {
    match &config.snapshot_dir {
        Some(dir) => Ok(Arc::new(
            FileSnapshotStore::open(dir.clone(), config.snapshots_to_keep).await?,
        )),
        None => Ok(Arc::new(MemorySnapshotStore::new())),
    }
}
