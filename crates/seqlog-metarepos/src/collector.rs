//! Report collection and commit delivery
//!
//! One executor task per registered storage node polls `GetReport`,
//! forwards the reports to the commit ticker through a bounded queue and
//! pushes commit results back to the node's replicas. Executors never
//! unregister an unreachable node; they keep retrying with backoff and
//! expose how long the node has been silent.

use crate::config::CollectorConfig;
use crate::error::{RepositoryError, Result};
use crate::metadata::{ClusterMetadata, MetadataStore};
use crate::observability::CollectorMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use seqlog_protocol::{
    CommitResult, LogStreamId, StorageNodeDescriptor, StorageNodeId, StorageNodeReport, Version,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// RPCs the repository issues to a storage node
#[async_trait]
pub trait StorageNodeClient: Send + Sync {
    /// Uncommitted progress of every replica on the node
    async fn get_report(&self) -> Result<StorageNodeReport>;

    /// Deliver one commit result to the replica of `result.log_stream_id`
    async fn commit(&self, result: CommitResult) -> Result<()>;
}

/// Creates clients for registered storage nodes
#[async_trait]
pub trait StorageNodeClientFactory: Send + Sync + 'static {
    async fn connect(&self, descriptor: &StorageNodeDescriptor)
        -> Result<Arc<dyn StorageNodeClient>>;
}

/// State shared between the collector and its executors
struct Shared {
    config: CollectorConfig,
    store: MetadataStore,
    factory: Arc<dyn StorageNodeClientFactory>,
    report_tx: mpsc::Sender<StorageNodeReport>,
    version_rx: watch::Receiver<Version>,
    /// Log stream → storage nodes hosting a replica
    committers: DashMap<LogStreamId, Vec<StorageNodeId>>,
}

struct Executor {
    descriptor: StorageNodeDescriptor,
    last_report: Arc<Mutex<Option<Instant>>>,
    task: JoinHandle<()>,
}

/// Per-storage-node executors and per-log-stream committers
pub struct ReportCollector {
    shared: Arc<Shared>,
    executors: DashMap<StorageNodeId, Executor>,
}

impl ReportCollector {
    pub fn new(
        config: CollectorConfig,
        store: MetadataStore,
        factory: Arc<dyn StorageNodeClientFactory>,
        report_tx: mpsc::Sender<StorageNodeReport>,
        version_rx: watch::Receiver<Version>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                factory,
                report_tx,
                version_rx,
                committers: DashMap::new(),
            }),
            executors: DashMap::new(),
        }
    }

    /// Rebuild executors and committers from scratch (startup, snapshot install)
    pub fn recover(&self, metadata: &ClusterMetadata) {
        self.shared.committers.clear();
        self.sync(metadata);
        info!(
            executors = self.num_executors(),
            committers = self.num_committers(),
            "Report collector recovered"
        );
    }

    /// Match executors and committers to the registry
    pub fn sync(&self, metadata: &ClusterMetadata) {
        let registered: BTreeSet<StorageNodeId> = metadata.storage_nodes.keys().copied().collect();

        let stale: Vec<StorageNodeId> = self
            .executors
            .iter()
            .map(|e| *e.key())
            .filter(|id| !registered.contains(id))
            .collect();
        for id in stale {
            self.remove_executor(id);
        }
        for descriptor in metadata.storage_nodes.values() {
            if !self.executors.contains_key(&descriptor.storage_node_id) {
                self.add_executor(descriptor.clone());
            }
        }

        self.shared
            .committers
            .retain(|ls, _| metadata.log_streams.contains_key(ls));
        for (id, ls) in &metadata.log_streams {
            self.shared
                .committers
                .insert(*id, ls.descriptor.replica_ids());
        }

        CollectorMetrics::set_executor_count(self.num_executors());
        CollectorMetrics::set_committer_count(self.num_committers());
    }

    fn add_executor(&self, descriptor: StorageNodeDescriptor) {
        let id = descriptor.storage_node_id;
        let last_report = Arc::new(Mutex::new(None));
        let runner = ExecutorTask {
            shared: Arc::clone(&self.shared),
            descriptor: descriptor.clone(),
            last_report: Arc::clone(&last_report),
            known: BTreeMap::new(),
            client: None,
        };
        let task = tokio::spawn(runner.run());

        debug!(storage_node = %id, address = %descriptor.address, "Started report executor");
        self.executors.insert(
            id,
            Executor {
                descriptor,
                last_report,
                task,
            },
        );
    }

    fn remove_executor(&self, id: StorageNodeId) {
        if let Some((_, executor)) = self.executors.remove(&id) {
            executor.task.abort();
            debug!(storage_node = %id, "Stopped report executor");
        }
    }

    pub fn num_executors(&self) -> usize {
        self.executors.len()
    }

    pub fn num_committers(&self) -> usize {
        self.shared.committers.len()
    }

    pub fn has_executor(&self, id: StorageNodeId) -> bool {
        self.executors.contains_key(&id)
    }

    /// Time since the last successful report per node (`None` if never)
    pub fn staleness(&self) -> BTreeMap<StorageNodeId, Option<Duration>> {
        self.executors
            .iter()
            .map(|e| {
                let elapsed = e.last_report.lock().map(|at| at.elapsed());
                (*e.key(), elapsed)
            })
            .collect()
    }

    /// Nodes without a successful report for longer than the staleness timeout
    pub fn stale_nodes(&self) -> Vec<StorageNodeDescriptor> {
        let timeout = self.shared.config.staleness_timeout;
        self.executors
            .iter()
            .filter(|e| {
                e.last_report
                    .lock()
                    .map_or(true, |at| at.elapsed() > timeout)
            })
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Stop every executor
    pub fn shutdown(&self) {
        let ids: Vec<StorageNodeId> = self.executors.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove_executor(id);
        }
    }
}

impl Drop for ReportCollector {
    fn drop(&mut self) {
        for executor in self.executors.iter() {
            executor.task.abort();
        }
    }
}

/// Exponential backoff with ±25% jitter
pub(crate) fn calculate_backoff(attempt: u32, min: Duration, max: Duration) -> Duration {
    let base = min.as_millis() as f64 * 2f64.powi(attempt.min(16) as i32);
    let capped = base.min(max.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * capped;
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

struct ExecutorTask {
    shared: Arc<Shared>,
    descriptor: StorageNodeDescriptor,
    last_report: Arc<Mutex<Option<Instant>>>,
    /// Version each hosted replica has applied, as far as we know
    known: BTreeMap<LogStreamId, Version>,
    client: Option<Arc<dyn StorageNodeClient>>,
}

impl ExecutorTask {
    async fn run(mut self) {
        let id = self.descriptor.storage_node_id;
        let mut version_rx = self.shared.version_rx.clone();
        let mut interval = tokio::time::interval(self.shared.config.report_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_report().await {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = calculate_backoff(
                                failures,
                                self.shared.config.retry_backoff_min,
                                self.shared.config.retry_backoff_max,
                            );
                            warn!(
                                storage_node = %id,
                                error = %e,
                                failures,
                                ?delay,
                                "Report failed"
                            );
                            self.client = None;
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        debug!(storage_node = %id, "Commit notifications closed");
                        break;
                    }
                    if let Err(e) = self.push_commits().await {
                        warn!(storage_node = %id, error = %e, "Commit delivery failed");
                        self.client = None;
                    }
                }
            }
        }
    }

    async fn client(&mut self) -> Result<Arc<dyn StorageNodeClient>> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }
        let rpc_timeout = self.shared.config.rpc_timeout;
        let client =
            tokio::time::timeout(rpc_timeout, self.shared.factory.connect(&self.descriptor))
                .await??;
        self.client = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn poll_report(&mut self) -> Result<()> {
        let client = self.client().await?;
        let started = Instant::now();
        let report = tokio::time::timeout(self.shared.config.rpc_timeout, client.get_report())
            .await
            .map_err(|_| {
                CollectorMetrics::increment_rpc_errors("get_report");
                RepositoryError::Rpc {
                    storage_node_id: self.descriptor.storage_node_id,
                    message: "get_report timed out".into(),
                }
            })??;
        CollectorMetrics::record_report_latency(started.elapsed());
        *self.last_report.lock() = Some(Instant::now());

        let mut behind = false;
        let last_version = *self.shared.version_rx.borrow();
        for r in &report.reports {
            self.known.insert(r.log_stream_id, r.version);
            behind |= r.version < last_version;
        }

        if !report.is_empty() {
            trace!(
                storage_node = %report.storage_node_id,
                replicas = report.reports.len(),
                "Collected report"
            );
            if self.shared.report_tx.try_send(report).is_err() {
                CollectorMetrics::increment_reports_dropped();
            }
        }

        if behind {
            self.push_commits().await?;
        }
        Ok(())
    }

    /// Send each hosted replica the results it has not applied yet
    async fn push_commits(&mut self) -> Result<()> {
        let id = self.descriptor.storage_node_id;
        let hosted: Vec<LogStreamId> = self
            .shared
            .committers
            .iter()
            .filter(|e| e.value().contains(&id))
            .map(|e| *e.key())
            .collect();
        if hosted.is_empty() {
            return Ok(());
        }

        let pending: Vec<(LogStreamId, Vec<CommitResult>)> = {
            let metadata = self.shared.store.read().await;
            hosted
                .into_iter()
                .map(|ls| {
                    let known = self.known.get(&ls).copied().unwrap_or(Version::INVALID);
                    (ls, metadata.commit_results_since(ls, known))
                })
                .filter(|(_, results)| !results.is_empty())
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let client = self.client().await?;
        let rpc_timeout = self.shared.config.rpc_timeout;
        let mut pushed = 0;
        for (ls, results) in pending {
            for result in results {
                tokio::time::timeout(rpc_timeout, client.commit(result))
                    .await
                    .map_err(|_| {
                        CollectorMetrics::increment_rpc_errors("commit");
                        RepositoryError::Rpc {
                            storage_node_id: id,
                            message: "commit timed out".into(),
                        }
                    })??;
                self.known.insert(ls, result.version);
                pushed += 1;
            }
        }
        CollectorMetrics::add_commits_pushed(pushed);
        trace!(storage_node = %id, pushed, "Delivered commit results");
        Ok(())
    }
}
