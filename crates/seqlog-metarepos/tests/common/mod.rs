//! Shared test infrastructure: in-process storage nodes and repository setup

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use seqlog_metarepos::{
    CollectorConfig, MetadataRepository, RepositoryConfig, RepositoryError, Result,
    StorageNodeClient, StorageNodeClientFactory,
};
use seqlog_protocol::{
    CommitResult, Glsn, Llsn, LogStreamDescriptor, LogStreamId, ReplicaStatus,
    StorageNodeDescriptor, StorageNodeId, StorageNodeReport, TopicId, UncommittedReport, Version,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Repository settings tuned for fast tests
pub fn test_config(node_index: u64, replication_factor: usize) -> RepositoryConfig {
    RepositoryConfig::builder()
        .node_index(node_index)
        .replication_factor(replication_factor)
        .commit_tick(Duration::from_millis(2))
        .request_timeout(Duration::from_secs(2))
        .collector(CollectorConfig {
            report_interval: Duration::from_millis(5),
            rpc_timeout: Duration::from_millis(200),
            retry_backoff_min: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(50),
            staleness_timeout: Duration::from_millis(100),
        })
        .build()
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the repository stops applying entries
pub async fn settle(repo: &MetadataRepository) {
    let mut last = repo.applied_index();
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = repo.applied_index();
        if now == last {
            return;
        }
        last = now;
    }
}

/// All non-empty results in the retained history, oldest first
pub async fn history(repo: &MetadataRepository) -> Vec<CommitResult> {
    let mut results = Vec::new();
    let mut version = Version::INVALID;
    while let Some(round) = repo.lookup_next_commit_results(version).await.unwrap() {
        assert_eq!(round.version, version.next(), "versions must be contiguous");
        results.extend(round.results.iter().filter(|r| !r.is_empty()).copied());
        version = round.version;
    }
    results
}

// ============================================================================
// Storage nodes
// ============================================================================

#[derive(Debug, Clone)]
struct Replica {
    version: Version,
    high_watermark: Glsn,
    /// One past the last committed LLSN
    committed_end: Llsn,
    /// One past the last written LLSN
    written_end: Llsn,
    status: ReplicaStatus,
    /// Committed end at which the replica stops
    seal_at: Option<Llsn>,
    /// Non-empty commit results applied, in order
    applied: Vec<CommitResult>,
}

impl Replica {
    fn new() -> Self {
        Self {
            version: Version::INVALID,
            high_watermark: Glsn::INVALID,
            committed_end: Llsn::MIN,
            written_end: Llsn::MIN,
            status: ReplicaStatus::Running,
            seal_at: None,
            applied: Vec::new(),
        }
    }

    fn try_finish_seal(&mut self) {
        if let Some(end) = self.seal_at {
            if self.committed_end >= end {
                self.written_end = self.committed_end;
                self.status = ReplicaStatus::Sealed;
            }
        }
    }
}

/// In-process storage node hosting log stream replicas
pub struct MockStorageNode {
    id: StorageNodeId,
    replicas: Mutex<BTreeMap<LogStreamId, Replica>>,
    down: AtomicBool,
}

impl MockStorageNode {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: StorageNodeId(id),
            replicas: Mutex::new(BTreeMap::new()),
            down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> StorageNodeId {
        self.id
    }

    pub fn descriptor(&self) -> StorageNodeDescriptor {
        StorageNodeDescriptor::new(self.id, format!("sn-{}:9091", self.id))
    }

    pub fn add_replica(&self, log_stream_id: LogStreamId) {
        self.replicas
            .lock()
            .entry(log_stream_id)
            .or_insert_with(Replica::new);
    }

    /// Write `n` entries to a running replica
    pub fn append(&self, log_stream_id: LogStreamId, n: u64) {
        let mut replicas = self.replicas.lock();
        let replica = replicas
            .get_mut(&log_stream_id)
            .expect("replica not hosted");
        assert_eq!(replica.status, ReplicaStatus::Running, "append to sealed replica");
        replica.written_end = replica.written_end.advance(n);
    }

    /// Stop at `last_committed` (drops anything written past it)
    pub fn seal(&self, log_stream_id: LogStreamId, last_committed: Llsn) {
        let mut replicas = self.replicas.lock();
        let replica = replicas
            .get_mut(&log_stream_id)
            .expect("replica not hosted");
        replica.status = ReplicaStatus::Sealing;
        replica.seal_at = Some(last_committed.advance(1));
        replica.try_finish_seal();
    }

    pub fn unseal(&self, log_stream_id: LogStreamId) {
        let mut replicas = self.replicas.lock();
        let replica = replicas
            .get_mut(&log_stream_id)
            .expect("replica not hosted");
        replica.status = ReplicaStatus::Running;
        replica.seal_at = None;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn committed_end(&self, log_stream_id: LogStreamId) -> Llsn {
        self.replicas
            .lock()
            .get(&log_stream_id)
            .map(|r| r.committed_end)
            .unwrap_or(Llsn::MIN)
    }

    pub fn version(&self, log_stream_id: LogStreamId) -> Version {
        self.replicas
            .lock()
            .get(&log_stream_id)
            .map(|r| r.version)
            .unwrap_or(Version::INVALID)
    }

    pub fn status(&self, log_stream_id: LogStreamId) -> Option<ReplicaStatus> {
        self.replicas.lock().get(&log_stream_id).map(|r| r.status)
    }

    /// Non-empty commit results the replica applied
    pub fn applied(&self, log_stream_id: LogStreamId) -> Vec<CommitResult> {
        self.replicas
            .lock()
            .get(&log_stream_id)
            .map(|r| r.applied.clone())
            .unwrap_or_default()
    }

    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RepositoryError::Rpc {
                storage_node_id: self.id,
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageNodeClient for MockStorageNode {
    async fn get_report(&self) -> Result<StorageNodeReport> {
        self.check_up()?;
        let replicas = self.replicas.lock();
        let reports = replicas
            .iter()
            .map(|(ls, r)| {
                UncommittedReport::new(self.id, *ls)
                    .with_version(r.version, r.high_watermark)
                    .with_uncommitted(r.committed_end, r.written_end.get() - r.committed_end.get())
                    .with_status(r.status)
            })
            .collect();
        Ok(StorageNodeReport::new(self.id, reports))
    }

    async fn commit(&self, result: CommitResult) -> Result<()> {
        self.check_up()?;
        let mut replicas = self.replicas.lock();
        let Some(replica) = replicas.get_mut(&result.log_stream_id) else {
            return Ok(());
        };
        if result.version <= replica.version {
            return Ok(());
        }
        if !result.is_empty() {
            assert_eq!(
                result.committed_llsn_offset, replica.committed_end,
                "commit result leaves a gap on {}",
                self.id
            );
            assert!(
                result.committed_llsn_end() <= replica.written_end,
                "commit beyond written entries on {}",
                self.id
            );
            replica.committed_end = result.committed_llsn_end();
            replica.applied.push(result);
        }
        replica.version = result.version;
        replica.high_watermark = result.high_watermark;
        replica.try_finish_seal();
        Ok(())
    }
}

/// Connects the collector to [`MockStorageNode`]s
#[derive(Default)]
pub struct MockStorageNodes {
    nodes: Mutex<BTreeMap<StorageNodeId, Arc<MockStorageNode>>>,
}

impl MockStorageNodes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: u32) -> Arc<MockStorageNode> {
        let node = MockStorageNode::new(id);
        self.nodes.lock().insert(node.id(), Arc::clone(&node));
        node
    }

    pub fn get(&self, id: u32) -> Arc<MockStorageNode> {
        Arc::clone(&self.nodes.lock()[&StorageNodeId(id)])
    }
}

#[async_trait]
impl StorageNodeClientFactory for MockStorageNodes {
    async fn connect(
        &self,
        descriptor: &StorageNodeDescriptor,
    ) -> Result<Arc<dyn StorageNodeClient>> {
        let node = self
            .nodes
            .lock()
            .get(&descriptor.storage_node_id)
            .cloned()
            .ok_or(RepositoryError::Rpc {
                storage_node_id: descriptor.storage_node_id,
                message: "unknown address".into(),
            })?;
        node.check_up()?;
        Ok(node as Arc<dyn StorageNodeClient>)
    }
}

/// Register storage nodes, a topic and one log stream hosted on all of them
pub async fn setup_log_stream(
    repo: &MetadataRepository,
    nodes: &[Arc<MockStorageNode>],
    topic: u32,
    log_stream: u32,
) -> LogStreamDescriptor {
    for node in nodes {
        repo.register_storage_node(node.descriptor()).await.unwrap();
        node.add_replica(LogStreamId(log_stream));
    }
    repo.register_topic(TopicId(topic)).await.unwrap();
    repo.register_log_stream(LogStreamDescriptor::new(
        TopicId(topic),
        LogStreamId(log_stream),
        nodes.iter().map(|n| n.id()),
    ))
    .await
    .unwrap()
}

/// Committed end of a log stream as recorded in the repository
pub async fn committed_end(repo: &MetadataRepository, log_stream: u32) -> Llsn {
    repo.store()
        .read()
        .await
        .committed_llsn_end(LogStreamId(log_stream))
}
