//! Metadata repository replica
//!
//! [`MetadataRepository`] is the request surface of one replica. Mutating
//! requests are proposed to the consensus log tagged with a local waiter
//! and answered when the apply loop reaches them; reads are served from the
//! local store. Every call is bounded by `request_timeout`. A proposal that
//! is lost (leader change, partition) surfaces as
//! [`RepositoryError::DeadlineExceeded`]; registrations are idempotent so
//! callers can retry.
//!
//! Starting a replica spawns three kinds of background work:
//!
//! ```text
//!   storage nodes ──GetReport──▶ collector ──queue──▶ ticker ──propose──┐
//!        ▲                                                             ▼
//!        └──────Commit─────── collector ◀──version── apply loop ◀── consensus log
//! ```

use crate::apply::{ApplyContext, ApplyLoop};
use crate::collector::{ReportCollector, StorageNodeClientFactory};
use crate::config::RepositoryConfig;
use crate::consensus::ConsensusLog;
use crate::error::{RepositoryError, Result};
use crate::locks::LogStreamLocks;
use crate::metadata::{ClusterMetadata, MetadataCommand, MetadataResponse, MetadataStore};
use crate::observability::RepositoryMetrics;
use crate::protocol::{encode_proposal, Proposal};
use crate::requests::RequestMap;
use crate::ticker::CommitTicker;
use parking_lot::Mutex;
use seqlog_protocol::{
    ClusterInfo, CommitRound, Llsn, LogStreamDescriptor, LogStreamId, LogStreamStatus,
    MetadataDescriptor, PeerInfo, StorageNodeDescriptor, StorageNodeId, TopicId, Version,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One replica of the metadata repository
pub struct MetadataRepository {
    config: RepositoryConfig,
    store: MetadataStore,
    consensus: Arc<dyn ConsensusLog>,
    requests: Arc<RequestMap>,
    collector: Arc<ReportCollector>,
    locks: LogStreamLocks,
    applied_rx: watch::Receiver<u64>,
    version_rx: watch::Receiver<Version>,
    failed: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataRepository {
    /// Restore from the latest snapshot, replay the log and start serving
    pub async fn start(
        config: RepositoryConfig,
        consensus: Arc<dyn ConsensusLog>,
        factory: Arc<dyn StorageNodeClientFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if consensus.node_index() != config.node_index {
            return Err(RepositoryError::InvalidConfig(format!(
                "node_index {} does not match consensus member {}",
                config.node_index,
                consensus.node_index()
            )));
        }

        let (metadata, applied_index) = match consensus.load_snapshot().await? {
            Some(snapshot) => {
                info!(
                    applied_index = snapshot.applied_index,
                    last_version = %snapshot.metadata.last_version(),
                    "Restoring from snapshot"
                );
                (snapshot.metadata, snapshot.applied_index)
            }
            None => (ClusterMetadata::new(config.replication_factor), 0),
        };
        if metadata.replication_factor != config.replication_factor {
            return Err(RepositoryError::InvalidConfig(format!(
                "replication_factor {} does not match snapshot ({})",
                config.replication_factor, metadata.replication_factor
            )));
        }
        let last_version = metadata.last_version();

        let store = MetadataStore::from_metadata(metadata);
        let requests = RequestMap::new(config.node_index);
        let (report_tx, report_rx) = mpsc::channel(config.report_queue_capacity);
        let (version_tx, version_rx) = watch::channel(last_version);
        let (applied_tx, applied_rx) = watch::channel(applied_index);
        let (shutdown_tx, _) = broadcast::channel(1);
        let failed = Arc::new(AtomicBool::new(false));

        let collector = Arc::new(ReportCollector::new(
            config.collector.clone(),
            store.clone(),
            factory,
            report_tx,
            version_rx.clone(),
        ));
        collector.recover(&*store.read().await);

        let entries = consensus.open(applied_index).await?;
        let apply = ApplyLoop::new(
            ApplyContext {
                store: store.clone(),
                requests: Arc::clone(&requests),
                consensus: Arc::clone(&consensus),
                collector: Arc::clone(&collector),
                applied_tx,
                version_tx,
                failed: Arc::clone(&failed),
                snapshot_threshold: config.snapshot_threshold,
            },
            entries,
            applied_index,
        );
        let ticker = CommitTicker {
            consensus: Arc::clone(&consensus),
            store: store.clone(),
            requests: Arc::clone(&requests),
            reports: report_rx,
            tick: config.commit_tick,
        };

        let tasks = vec![
            tokio::spawn(apply.run(shutdown_tx.subscribe())),
            tokio::spawn(ticker.run(shutdown_tx.subscribe())),
        ];

        info!(
            cluster_id = config.cluster_id,
            node_index = config.node_index,
            incarnation = %requests.incarnation(),
            applied_index,
            last_version = %last_version,
            "Metadata repository started"
        );

        Ok(Arc::new(Self {
            locks: LogStreamLocks::new(config.log_stream_lock_shards),
            config,
            store,
            consensus,
            requests,
            collector,
            applied_rx,
            version_rx,
            failed,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    // ==================== Registry ====================

    pub async fn register_storage_node(&self, descriptor: StorageNodeDescriptor) -> Result<()> {
        self.request(MetadataCommand::RegisterStorageNode { descriptor })
            .await
            .map(|_| ())
    }

    pub async fn unregister_storage_node(&self, storage_node_id: StorageNodeId) -> Result<()> {
        self.request(MetadataCommand::UnregisterStorageNode { storage_node_id })
            .await
            .map(|_| ())
    }

    pub async fn register_topic(&self, topic_id: TopicId) -> Result<()> {
        self.request(MetadataCommand::RegisterTopic { topic_id })
            .await
            .map(|_| ())
    }

    pub async fn unregister_topic(&self, topic_id: TopicId) -> Result<()> {
        self.request(MetadataCommand::UnregisterTopic { topic_id })
            .await
            .map(|_| ())
    }

    pub async fn register_log_stream(
        &self,
        descriptor: LogStreamDescriptor,
    ) -> Result<LogStreamDescriptor> {
        match self
            .request(MetadataCommand::RegisterLogStream { descriptor })
            .await?
        {
            MetadataResponse::LogStream(descriptor) => Ok(descriptor),
            _ => Err(RepositoryError::UnexpectedResponse {
                operation: "register_log_stream",
            }),
        }
    }

    pub async fn unregister_log_stream(&self, log_stream_id: LogStreamId) -> Result<()> {
        self.ensure_serving()?;
        let _guard = self.locks.lock(log_stream_id).await;
        self.request(MetadataCommand::UnregisterLogStream { log_stream_id })
            .await
            .map(|_| ())
    }

    /// Replace the replica set of a sealed log stream
    pub async fn update_log_stream(
        &self,
        descriptor: LogStreamDescriptor,
    ) -> Result<LogStreamDescriptor> {
        self.ensure_serving()?;
        let _guard = self.locks.lock(descriptor.log_stream_id).await;
        match self
            .request(MetadataCommand::UpdateLogStream { descriptor })
            .await?
        {
            MetadataResponse::LogStream(descriptor) => Ok(descriptor),
            _ => Err(RepositoryError::UnexpectedResponse {
                operation: "update_log_stream",
            }),
        }
    }

    // ==================== Sealing ====================

    /// Seal a log stream and return its last committed LLSN
    ///
    /// Waits until every replica has reported Sealed at the committed end.
    pub async fn seal(&self, log_stream_id: LogStreamId) -> Result<Llsn> {
        self.ensure_serving()?;
        let _guard = self.locks.lock(log_stream_id).await;
        let started = Instant::now();
        let result = self
            .seal_until(log_stream_id, started + self.config.request_timeout)
            .await;
        self.record_outcome("seal", started, &result);
        result
    }

    async fn seal_until(&self, id: LogStreamId, deadline: Instant) -> Result<Llsn> {
        let response = self
            .propose_until(MetadataCommand::Seal { log_stream_id: id }, deadline)
            .await?;
        let MetadataResponse::Sealed {
            status,
            last_committed_llsn,
        } = response
        else {
            return Err(RepositoryError::UnexpectedResponse { operation: "seal" });
        };
        if status == LogStreamStatus::Sealed {
            return Ok(last_committed_llsn);
        }

        debug!(
            log_stream = %id,
            last_committed_llsn = %last_committed_llsn,
            "Waiting for replicas to seal"
        );
        let mut applied = self.applied_rx.clone();
        loop {
            applied.borrow_and_update();
            {
                let metadata = self.store.read().await;
                let state = metadata
                    .log_stream(id)
                    .ok_or(RepositoryError::LogStreamNotFound(id))?;
                match state.status() {
                    LogStreamStatus::Sealed => {
                        return Ok(metadata.committed_llsn_end(id).saturating_sub(1));
                    }
                    LogStreamStatus::Sealing => {}
                    status => {
                        return Err(RepositoryError::InvalidStatusTransition {
                            log_stream_id: id,
                            status,
                            operation: "seal",
                        });
                    }
                }
            }

            match tokio::time::timeout_at(deadline, applied.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(RepositoryError::ShuttingDown),
                Err(_) => return Err(RepositoryError::DeadlineExceeded),
            }
        }
    }

    /// Start unsealing; the log stream runs again once every replica reports Running
    pub async fn unseal(&self, log_stream_id: LogStreamId) -> Result<LogStreamDescriptor> {
        self.ensure_serving()?;
        let _guard = self.locks.lock(log_stream_id).await;
        match self
            .request(MetadataCommand::Unseal { log_stream_id })
            .await?
        {
            MetadataResponse::LogStream(descriptor) => Ok(descriptor),
            _ => Err(RepositoryError::UnexpectedResponse { operation: "unseal" }),
        }
    }

    // ==================== Membership ====================

    pub async fn add_peer(&self, node_index: u64, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        self.request(MetadataCommand::AddPeer {
            peer: PeerInfo {
                node_index,
                url: url.clone(),
            },
        })
        .await?;
        self.consensus.add_peer(node_index, &url).await
    }

    pub async fn remove_peer(&self, node_index: u64) -> Result<()> {
        self.request(MetadataCommand::RemovePeer { node_index })
            .await?;
        self.consensus.remove_peer(node_index).await
    }

    // ==================== Queries ====================

    pub async fn get_metadata(&self) -> Result<MetadataDescriptor> {
        self.ensure_serving()?;
        Ok(self.store.read().await.metadata_descriptor())
    }

    pub async fn get_cluster_info(&self) -> Result<ClusterInfo> {
        self.ensure_serving()?;
        let metadata = self.store.read().await;
        Ok(ClusterInfo {
            cluster_id: self.config.cluster_id,
            node_index: self.config.node_index,
            leader: self.consensus.leader(),
            replication_factor: metadata.replication_factor,
            applied_index: metadata.last_applied_index,
            last_version: metadata.last_version(),
            peers: metadata.peers.values().cloned().collect(),
        })
    }

    pub async fn get_last_commit_results(&self) -> Result<Option<CommitRound>> {
        self.ensure_serving()?;
        Ok(self.store.read().await.last_commit_results().cloned())
    }

    /// First retained round after `version`
    pub async fn lookup_next_commit_results(
        &self,
        version: Version,
    ) -> Result<Option<CommitRound>> {
        self.ensure_serving()?;
        Ok(self
            .store
            .read()
            .await
            .lookup_next_commit_results(version)
            .cloned())
    }

    /// Wait until the local commit version reaches `version`
    pub async fn wait_for_version(&self, version: Version, timeout: Duration) -> Result<Version> {
        let mut rx = self.version_rx.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|v| *v >= version))
            .await?
            .map_err(|_| RepositoryError::ShuttingDown)?;
        Ok(*reached)
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn collector(&self) -> &ReportCollector {
        &self.collector
    }

    pub fn node_index(&self) -> u64 {
        self.config.node_index
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied_rx.borrow()
    }

    pub fn last_version(&self) -> Version {
        *self.version_rx.borrow()
    }

    /// Whether the apply loop stopped on an unrecoverable error
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Stop background work and fail pending requests
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.collector.shutdown();
        self.requests.fail_all(|| RepositoryError::ShuttingDown);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(node_index = self.config.node_index, "Metadata repository stopped");
    }

    // ==================== Internals ====================

    fn ensure_serving(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(RepositoryError::Fatal("apply loop stopped".into()));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RepositoryError::ShuttingDown);
        }
        Ok(())
    }

    /// Propose `command` and wait for its apply result
    async fn request(&self, command: MetadataCommand) -> Result<MetadataResponse> {
        self.ensure_serving()?;
        let op = command.name();
        let started = Instant::now();
        let result = self
            .propose_until(command, started + self.config.request_timeout)
            .await;
        self.record_outcome(op, started, &result);
        result
    }

    async fn propose_until(
        &self,
        command: MetadataCommand,
        deadline: Instant,
    ) -> Result<MetadataResponse> {
        let pending = self.requests.register();
        RepositoryMetrics::increment_proposals(command.name());
        let data = encode_proposal(&Proposal::new(pending.tag(), command))?;

        tokio::time::timeout_at(deadline, self.consensus.propose(data)).await??;
        pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    fn record_outcome<T>(&self, op: &'static str, started: Instant, result: &Result<T>) {
        RepositoryMetrics::record_request_latency(op, started.elapsed());
        match result {
            Err(RepositoryError::DeadlineExceeded) => {
                RepositoryMetrics::increment_deadline_exceeded(op);
                warn!(op, "Request deadline exceeded");
            }
            Err(e) => debug!(op, error = %e, "Request failed"),
            Ok(_) => {}
        }
    }
}

impl Drop for MetadataRepository {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
