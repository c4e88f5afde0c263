//! Commit ticker
//!
//! Runs on every replica but only the leader proposes. Each tick drains the
//! report queue, proposes the reports that would change the store, then
//! proposes `Commit { base_version }` when there is something to commit.
//! Followers drain and discard so their queue never backs up.

use crate::calculator;
use crate::consensus::ConsensusLog;
use crate::error::Result;
use crate::metadata::{MetadataCommand, MetadataStore};
use crate::observability::RepositoryMetrics;
use crate::protocol::{encode_proposal, Proposal};
use crate::requests::RequestMap;
use seqlog_protocol::{LogStreamId, StorageNodeId, StorageNodeReport, UncommittedReport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub(crate) struct CommitTicker {
    pub consensus: Arc<dyn ConsensusLog>,
    pub store: MetadataStore,
    pub requests: Arc<RequestMap>,
    pub reports: mpsc::Receiver<StorageNodeReport>,
    pub tick: Duration,
}

impl CommitTicker {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut was_leader = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let is_leader = self.consensus.is_leader();
                    if is_leader != was_leader {
                        info!(
                            node_index = self.consensus.node_index(),
                            is_leader,
                            "Leadership changed"
                        );
                        RepositoryMetrics::set_is_leader(is_leader);
                        was_leader = is_leader;
                    }

                    let batch = self.drain_reports();
                    if !is_leader {
                        continue;
                    }
                    if let Err(e) = self.propose_round(batch).await {
                        debug!(error = %e, "Commit tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Commit ticker shutting down");
                    break;
                }
            }
        }
    }

    /// Latest queued report per replica, grouped by storage node
    fn drain_reports(&mut self) -> Vec<StorageNodeReport> {
        let mut latest: BTreeMap<(StorageNodeId, LogStreamId), UncommittedReport> = BTreeMap::new();
        while let Ok(report) = self.reports.try_recv() {
            for r in report.reports {
                latest.insert((r.storage_node_id, r.log_stream_id), r);
            }
        }

        let mut grouped: BTreeMap<StorageNodeId, Vec<UncommittedReport>> = BTreeMap::new();
        for ((sn, _), r) in latest {
            grouped.entry(sn).or_default().push(r);
        }
        grouped
            .into_iter()
            .map(|(sn, reports)| StorageNodeReport::new(sn, reports))
            .collect()
    }

    async fn propose_round(&self, batch: Vec<StorageNodeReport>) -> Result<()> {
        let (reports, base_version, committable) = {
            let metadata = self.store.read().await;
            let reports: Vec<StorageNodeReport> = batch
                .into_iter()
                .filter_map(|mut report| {
                    report.reports.retain(|r| metadata.would_accept_report(r));
                    (!report.is_empty()).then_some(report)
                })
                .collect();
            let committable = calculator::build_commit_round(&metadata).is_some();
            (reports, metadata.last_version(), committable)
        };

        if reports.is_empty() && !committable {
            return Ok(());
        }
        if !reports.is_empty() {
            RepositoryMetrics::record_report_batch(reports.iter().map(|r| r.reports.len()).sum());
            self.propose(MetadataCommand::Reports { reports }).await?;
        }
        self.propose(MetadataCommand::Commit { base_version }).await
    }

    async fn propose(&self, command: MetadataCommand) -> Result<()> {
        RepositoryMetrics::increment_proposals(command.name());
        let data = encode_proposal(&Proposal::new(self.requests.background_tag(), command))?;
        self.consensus.propose(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{LogEntry, MemoryCluster};
    use crate::protocol::decode_proposal;
    use seqlog_protocol::{
        Llsn, LogStreamDescriptor, StorageNodeDescriptor, TopicId, Version,
    };

    async fn drain(rx: &mut mpsc::UnboundedReceiver<LogEntry>) -> Vec<MetadataCommand> {
        let mut commands = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            commands.push(decode_proposal(&entry.data).unwrap().command);
        }
        commands
    }

    async fn ticker(
        store: MetadataStore,
    ) -> (
        CommitTicker,
        mpsc::Sender<StorageNodeReport>,
        mpsc::UnboundedReceiver<LogEntry>,
    ) {
        let node = MemoryCluster::standalone().node(1);
        let log = node.open(0).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let ticker = CommitTicker {
            consensus: Arc::new(node),
            store,
            requests: RequestMap::new(1),
            reports: rx,
            tick: Duration::from_millis(1),
        };
        (ticker, tx, log)
    }

    async fn store_with_stream() -> MetadataStore {
        let store = MetadataStore::new(1);
        {
            let mut m = store.write().await;
            m.register_storage_node(StorageNodeDescriptor::new(StorageNodeId(1), "sn-1"))
                .unwrap();
            m.register_topic(TopicId(1)).unwrap();
            m.register_log_stream(LogStreamDescriptor::new(
                TopicId(1),
                LogStreamId(1),
                [StorageNodeId(1)],
            ))
            .unwrap();
        }
        store
    }

    fn report(offset: u64, len: u64) -> StorageNodeReport {
        StorageNodeReport::new(
            StorageNodeId(1),
            vec![UncommittedReport::new(StorageNodeId(1), LogStreamId(1))
                .with_uncommitted(Llsn(offset), len)],
        )
    }

    #[tokio::test]
    async fn test_drain_keeps_latest_per_replica() {
        let (mut ticker, tx, _log) = ticker(MetadataStore::new(1)).await;
        tx.send(report(1, 1)).await.unwrap();
        tx.send(report(1, 4)).await.unwrap();

        let batch = ticker.drain_reports();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].reports.len(), 1);
        assert_eq!(batch[0].reports[0].uncommitted_llsn_length, 4);
    }

    #[tokio::test]
    async fn test_proposes_reports_then_commit() {
        let store = store_with_stream().await;
        let (ticker, _tx, mut log) = ticker(store).await;

        ticker.propose_round(vec![report(1, 3)]).await.unwrap();

        let commands = drain(&mut log).await;
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], MetadataCommand::Reports { .. }));
        assert_eq!(
            commands[1],
            MetadataCommand::Commit {
                base_version: Version::INVALID
            }
        );
    }

    #[tokio::test]
    async fn test_idle_tick_proposes_nothing() {
        let store = store_with_stream().await;
        let (ticker, _tx, mut log) = ticker(store).await;

        ticker.propose_round(Vec::new()).await.unwrap();

        assert!(drain(&mut log).await.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_reports_are_filtered() {
        let store = store_with_stream().await;
        store.write().await.update_report(&report(1, 0).reports[0]);
        let (ticker, _tx, mut log) = ticker(store).await;

        ticker.propose_round(vec![report(1, 0)]).await.unwrap();

        assert!(drain(&mut log).await.is_empty());
    }
}
