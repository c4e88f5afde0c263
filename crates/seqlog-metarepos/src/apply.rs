//! Consensus apply loop
//!
//! The only writer of the [`MetadataStore`]. Committed entries arrive in log
//! order; each one is decoded, applied, handed to the waiting caller (if the
//! caller lives on this replica) and announced to the report collector.
//! Every `snapshot_threshold` applied entries a snapshot is handed to the
//! consensus log. Snapshots copy the state as applied; anything that changes
//! the state, history trimming included, happens inside `apply`.
//!
//! A gap in the entry indices or an undecodable payload means this replica
//! can no longer prove it agrees with the others. The loop stops and marks
//! the repository failed instead of guessing.

use crate::collector::ReportCollector;
use crate::consensus::{ConsensusLog, LogEntry};
use crate::error::{RepositoryError, Result};
use crate::metadata::{MetadataResponse, MetadataStore};
use crate::observability::RepositoryMetrics;
use crate::protocol::decode_proposal;
use crate::requests::RequestMap;
use crate::snapshot::SnapshotData;
use seqlog_protocol::Version;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Handles the apply loop publishes to
pub(crate) struct ApplyContext {
    pub store: MetadataStore,
    pub requests: Arc<RequestMap>,
    pub consensus: Arc<dyn ConsensusLog>,
    pub collector: Arc<ReportCollector>,
    pub applied_tx: watch::Sender<u64>,
    pub version_tx: watch::Sender<Version>,
    pub failed: Arc<AtomicBool>,
    pub snapshot_threshold: u64,
}

pub(crate) struct ApplyLoop {
    ctx: ApplyContext,
    entries: mpsc::UnboundedReceiver<LogEntry>,
    applied_index: u64,
    since_snapshot: u64,
}

impl ApplyLoop {
    pub fn new(
        ctx: ApplyContext,
        entries: mpsc::UnboundedReceiver<LogEntry>,
        applied_index: u64,
    ) -> Self {
        Self {
            ctx,
            entries,
            applied_index,
            since_snapshot: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(applied_index = self.applied_index, "Apply loop started");

        loop {
            tokio::select! {
                entry = self.entries.recv() => {
                    let Some(entry) = entry else {
                        info!(applied_index = self.applied_index, "Committed entry stream closed");
                        break;
                    };
                    if let Err(e) = self.apply_entry(entry).await {
                        error!(
                            applied_index = self.applied_index,
                            error = %e,
                            "Apply loop stopped on unrecoverable error"
                        );
                        self.ctx.failed.store(true, Ordering::SeqCst);
                        let reason = e.to_string();
                        self.ctx
                            .requests
                            .fail_all(|| RepositoryError::Fatal(reason.clone()));
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Apply loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply one committed entry; errors returned here are fatal
    pub async fn apply_entry(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index <= self.applied_index {
            trace!(
                index = entry.index,
                applied_index = self.applied_index,
                "Skipping applied entry"
            );
            return Ok(());
        }
        if entry.index != self.applied_index + 1 {
            return Err(RepositoryError::CorruptData(format!(
                "log gap: expected index {}, got {}",
                self.applied_index + 1,
                entry.index
            )));
        }

        let proposal = decode_proposal(&entry.data).map_err(|e| {
            RepositoryError::CorruptData(format!("entry {} undecodable: {}", entry.index, e))
        })?;
        let kind = proposal.command.name();
        let changes_registry = proposal.command.changes_registry();

        let (result, last_version, history_len, round_total) = {
            let mut metadata = self.ctx.store.write().await;
            let result = metadata.apply(entry.index, proposal.command);
            if changes_registry && result.is_ok() {
                self.ctx.collector.sync(&metadata);
            }
            let round_total = metadata
                .last_commit_results()
                .map_or(0, |round| round.total_committed());
            (
                result,
                metadata.last_version(),
                metadata.commit_history.len(),
                round_total,
            )
        };

        match &result {
            Ok(MetadataResponse::Committed { version }) => {
                RepositoryMetrics::increment_commit_rounds();
                RepositoryMetrics::add_committed_entries(round_total);
                trace!(
                    index = entry.index,
                    version = %version,
                    entries = round_total,
                    "Applied commit round"
                );
            }
            Ok(MetadataResponse::ReportsApplied { updated }) => {
                RepositoryMetrics::add_reports_applied(*updated);
            }
            Ok(_) => {
                debug!(index = entry.index, kind, "Applied entry");
            }
            Err(RepositoryError::StaleVersion { expected, actual }) => {
                RepositoryMetrics::increment_stale_rounds();
                debug!(
                    index = entry.index,
                    base_version = %expected,
                    last_version = %actual,
                    "Discarded stale commit proposal"
                );
            }
            Err(e) if e.is_fatal() => {
                return Err(RepositoryError::Fatal(format!(
                    "entry {} ({}) failed: {}",
                    entry.index, kind, e
                )));
            }
            Err(e) => {
                debug!(index = entry.index, kind, error = %e, "Entry rejected");
            }
        }

        self.ctx.requests.complete(&proposal.tag, result);

        self.applied_index = entry.index;
        self.ctx.applied_tx.send_replace(entry.index);
        self.ctx.version_tx.send_if_modified(|current| {
            if *current == last_version {
                return false;
            }
            *current = last_version;
            true
        });
        RepositoryMetrics::set_applied_index(entry.index);
        RepositoryMetrics::set_last_version(last_version.get());
        RepositoryMetrics::set_commit_history_len(history_len);

        self.since_snapshot += 1;
        if self.since_snapshot >= self.ctx.snapshot_threshold {
            self.since_snapshot = 0;
            if let Err(e) = self.snapshot().await {
                warn!(applied_index = self.applied_index, error = %e, "Snapshot failed");
            }
        }
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<()> {
        let started = Instant::now();
        let snapshot = SnapshotData {
            applied_index: self.applied_index,
            metadata: self.ctx.store.read().await.clone(),
        };

        self.ctx.consensus.save_snapshot(&snapshot).await?;

        RepositoryMetrics::increment_snapshots();
        RepositoryMetrics::record_snapshot_duration(started.elapsed());
        info!(
            applied_index = snapshot.applied_index,
            rounds = snapshot.metadata.commit_history.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    #[cfg(test)]
    fn applied_index(&self) -> u64 {
        self.applied_index
    }
}
