//! Cluster metadata and the replicated state machine
//!
//! Every replica of the metadata repository holds one [`ClusterMetadata`]
//! and mutates it only by applying consensus-committed [`MetadataCommand`]s
//! in log order. Applying the same sequence of commands therefore yields the
//! same registry, the same reports and the same commit history everywhere.
//!
//! Managed state:
//! - Storage node, topic and log stream registries
//! - Latest accepted report per log stream replica
//! - Commit history (one [`CommitRound`] per version)
//! - Committed end and last commit version per log stream
//! - Consensus group membership (peers)
//!
//! All maps are `BTreeMap`s: iteration order feeds GLSN allocation and must
//! not depend on hashing. Commit decisions read the per log stream cursors,
//! never the history, and the history is trimmed only while applying
//! `Commit`, so every replica retains the same rounds.

use crate::calculator;
use crate::error::{RepositoryError, Result};
use crate::sealing;
use seqlog_protocol::{
    CommitResult, CommitRound, Glsn, Llsn, LogStreamDescriptor, LogStreamId, LogStreamStatus,
    MetadataDescriptor, PeerInfo, StorageNodeDescriptor, StorageNodeId, StorageNodeReport,
    TopicDescriptor, TopicId, UncommittedReport, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

/// Replicated log entry types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataCommand {
    // ==================== Registry Operations ====================
    /// Register a storage node
    RegisterStorageNode { descriptor: StorageNodeDescriptor },

    /// Unregister a storage node that hosts no replicas
    UnregisterStorageNode { storage_node_id: StorageNodeId },

    /// Register a topic
    RegisterTopic { topic_id: TopicId },

    /// Unregister a topic and all of its log streams
    UnregisterTopic { topic_id: TopicId },

    /// Register a log stream
    RegisterLogStream { descriptor: LogStreamDescriptor },

    /// Unregister a log stream
    UnregisterLogStream { log_stream_id: LogStreamId },

    /// Replace the replica set of a sealed log stream
    UpdateLogStream { descriptor: LogStreamDescriptor },

    // ==================== Status Operations ====================
    /// Stop committing to a log stream
    Seal { log_stream_id: LogStreamId },

    /// Resume committing to a sealed log stream
    Unseal { log_stream_id: LogStreamId },

    // ==================== Sequencing Operations ====================
    /// Batch of storage node reports collected since the last tick
    Reports { reports: Vec<StorageNodeReport> },

    /// Compute and append the round following `base_version`
    Commit { base_version: Version },

    // ==================== Membership Operations ====================
    /// Add a member to the consensus group
    AddPeer { peer: PeerInfo },

    /// Remove a member from the consensus group
    RemovePeer { node_index: u64 },

    /// No-op (leader confirmation)
    Noop,
}

impl MetadataCommand {
    /// Whether applying this command can change the storage node or log stream registry
    pub fn changes_registry(&self) -> bool {
        matches!(
            self,
            MetadataCommand::RegisterStorageNode { .. }
                | MetadataCommand::UnregisterStorageNode { .. }
                | MetadataCommand::UnregisterTopic { .. }
                | MetadataCommand::RegisterLogStream { .. }
                | MetadataCommand::UnregisterLogStream { .. }
                | MetadataCommand::UpdateLogStream { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetadataCommand::RegisterStorageNode { .. } => "register_storage_node",
            MetadataCommand::UnregisterStorageNode { .. } => "unregister_storage_node",
            MetadataCommand::RegisterTopic { .. } => "register_topic",
            MetadataCommand::UnregisterTopic { .. } => "unregister_topic",
            MetadataCommand::RegisterLogStream { .. } => "register_log_stream",
            MetadataCommand::UnregisterLogStream { .. } => "unregister_log_stream",
            MetadataCommand::UpdateLogStream { .. } => "update_log_stream",
            MetadataCommand::Seal { .. } => "seal",
            MetadataCommand::Unseal { .. } => "unseal",
            MetadataCommand::Reports { .. } => "reports",
            MetadataCommand::Commit { .. } => "commit",
            MetadataCommand::AddPeer { .. } => "add_peer",
            MetadataCommand::RemovePeer { .. } => "remove_peer",
            MetadataCommand::Noop => "noop",
        }
    }
}

/// Result of applying a metadata command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataResponse {
    Success,
    LogStream(LogStreamDescriptor),
    Sealed {
        status: LogStreamStatus,
        last_committed_llsn: Llsn,
    },
    ReportsApplied {
        updated: usize,
    },
    Committed {
        version: Version,
    },
    NoCommit,
}

/// Topic registration plus its allocation cursor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicState {
    pub descriptor: TopicDescriptor,
    /// Last GLSN handed out in this topic
    pub high_watermark: Glsn,
}

/// Most rounds kept before `Commit` trims the history
pub const COMMIT_HISTORY_RETENTION: usize = 256;

/// Log stream registration plus the latest accepted report of each replica
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogStreamState {
    pub descriptor: LogStreamDescriptor,
    pub reports: BTreeMap<StorageNodeId, UncommittedReport>,
    /// One past the last committed LLSN
    pub committed_end: Llsn,
    /// Last version that committed entries of this log stream
    pub last_commit_version: Version,
}

impl LogStreamState {
    pub fn new(descriptor: LogStreamDescriptor) -> Self {
        Self {
            descriptor,
            reports: BTreeMap::new(),
            committed_end: Llsn::MIN,
            last_commit_version: Version::INVALID,
        }
    }

    pub fn status(&self) -> LogStreamStatus {
        self.descriptor.status
    }
}

/// Cluster metadata state (replicated state machine)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    /// Required number of non-learner replicas per log stream
    pub replication_factor: usize,

    /// Registered storage nodes
    pub storage_nodes: BTreeMap<StorageNodeId, StorageNodeDescriptor>,

    /// Registered topics
    pub topics: BTreeMap<TopicId, TopicState>,

    /// Registered log streams
    pub log_streams: BTreeMap<LogStreamId, LogStreamState>,

    /// Commit rounds with contiguous versions, oldest first
    pub commit_history: VecDeque<CommitRound>,

    /// Consensus group members
    pub peers: BTreeMap<u64, PeerInfo>,

    /// Last applied log index
    pub last_applied_index: u64,

    /// Registry epoch (increments on registry changes)
    pub epoch: u64,
}

impl ClusterMetadata {
    /// Create new empty metadata
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            ..Default::default()
        }
    }

    /// Apply a command to the state machine
    ///
    /// Validation failures leave the state untouched apart from the applied index.
    pub fn apply(&mut self, index: u64, cmd: MetadataCommand) -> Result<MetadataResponse> {
        self.last_applied_index = index;

        match cmd {
            MetadataCommand::RegisterStorageNode { descriptor } => {
                self.register_storage_node(descriptor)
            }
            MetadataCommand::UnregisterStorageNode { storage_node_id } => {
                self.unregister_storage_node(storage_node_id)
            }
            MetadataCommand::RegisterTopic { topic_id } => self.register_topic(topic_id),
            MetadataCommand::UnregisterTopic { topic_id } => self.unregister_topic(topic_id),
            MetadataCommand::RegisterLogStream { descriptor } => {
                self.register_log_stream(descriptor)
            }
            MetadataCommand::UnregisterLogStream { log_stream_id } => {
                self.unregister_log_stream(log_stream_id)
            }
            MetadataCommand::UpdateLogStream { descriptor } => self.update_log_stream(descriptor),
            MetadataCommand::Seal { log_stream_id } => self.seal_log_stream(log_stream_id),
            MetadataCommand::Unseal { log_stream_id } => self.unseal_log_stream(log_stream_id),
            MetadataCommand::Reports { reports } => Ok(self.apply_reports(&reports)),
            MetadataCommand::Commit { base_version } => self.commit(base_version),
            MetadataCommand::AddPeer { peer } => self.add_peer(peer),
            MetadataCommand::RemovePeer { node_index } => self.remove_peer(node_index),
            MetadataCommand::Noop => Ok(MetadataResponse::Success),
        }
    }

    // ==================== Registry ====================

    /// Register a storage node (idempotent for an identical descriptor)
    pub fn register_storage_node(
        &mut self,
        descriptor: StorageNodeDescriptor,
    ) -> Result<MetadataResponse> {
        let id = descriptor.storage_node_id;
        if let Some(existing) = self.storage_nodes.get(&id) {
            if existing.address == descriptor.address {
                return Ok(MetadataResponse::Success);
            }
            return Err(RepositoryError::StorageNodeAlreadyExists(id));
        }

        info!(storage_node = %id, address = %descriptor.address, "Registered storage node");
        self.storage_nodes.insert(id, descriptor);
        self.epoch += 1;
        Ok(MetadataResponse::Success)
    }

    /// Unregister a storage node; fails while any log stream has a replica on it
    pub fn unregister_storage_node(&mut self, id: StorageNodeId) -> Result<MetadataResponse> {
        if !self.storage_nodes.contains_key(&id) {
            return Err(RepositoryError::StorageNodeNotFound(id));
        }
        if let Some(ls) = self
            .log_streams
            .values()
            .find(|ls| ls.descriptor.has_replica(id))
        {
            return Err(RepositoryError::StorageNodeInUse {
                storage_node_id: id,
                log_stream_id: ls.descriptor.log_stream_id,
            });
        }

        self.storage_nodes.remove(&id);
        self.epoch += 1;
        info!(storage_node = %id, "Unregistered storage node");
        Ok(MetadataResponse::Success)
    }

    /// Register a topic (idempotent)
    pub fn register_topic(&mut self, topic_id: TopicId) -> Result<MetadataResponse> {
        if self.topics.contains_key(&topic_id) {
            return Ok(MetadataResponse::Success);
        }

        self.topics.insert(
            topic_id,
            TopicState {
                descriptor: TopicDescriptor::new(topic_id),
                high_watermark: Glsn::INVALID,
            },
        );
        self.epoch += 1;
        info!(topic = %topic_id, "Registered topic");
        Ok(MetadataResponse::Success)
    }

    /// Unregister a topic together with its log streams
    pub fn unregister_topic(&mut self, topic_id: TopicId) -> Result<MetadataResponse> {
        let topic = self
            .topics
            .remove(&topic_id)
            .ok_or(RepositoryError::TopicNotFound(topic_id))?;

        for ls in &topic.descriptor.log_streams {
            self.log_streams.remove(ls);
        }
        self.epoch += 1;
        info!(
            topic = %topic_id,
            log_streams = topic.descriptor.log_streams.len(),
            "Unregistered topic"
        );
        Ok(MetadataResponse::Success)
    }

    /// Register a log stream (idempotent for identical topic and replicas)
    pub fn register_log_stream(
        &mut self,
        mut descriptor: LogStreamDescriptor,
    ) -> Result<MetadataResponse> {
        let id = descriptor.log_stream_id;
        if let Some(existing) = self.log_streams.get(&id) {
            if existing.descriptor.topic_id == descriptor.topic_id
                && existing.descriptor.replicas == descriptor.replicas
            {
                return Ok(MetadataResponse::LogStream(existing.descriptor.clone()));
            }
            return Err(RepositoryError::LogStreamAlreadyExists(id));
        }
        if !self.topics.contains_key(&descriptor.topic_id) {
            return Err(RepositoryError::TopicNotFound(descriptor.topic_id));
        }
        self.validate_replicas(&descriptor)?;

        descriptor.status = LogStreamStatus::Running;
        let topic_id = descriptor.topic_id;
        if let Some(topic) = self.topics.get_mut(&topic_id) {
            let list = &mut topic.descriptor.log_streams;
            if let Err(pos) = list.binary_search(&id) {
                list.insert(pos, id);
            }
        }
        self.log_streams.insert(id, LogStreamState::new(descriptor.clone()));
        self.epoch += 1;
        info!(
            log_stream = %id,
            topic = %topic_id,
            replicas = ?descriptor.replica_ids(),
            "Registered log stream"
        );
        Ok(MetadataResponse::LogStream(descriptor))
    }

    /// Unregister a log stream (not allowed while unsealing)
    pub fn unregister_log_stream(&mut self, id: LogStreamId) -> Result<MetadataResponse> {
        let state = self
            .log_streams
            .get(&id)
            .ok_or(RepositoryError::LogStreamNotFound(id))?;
        let status = state.status();
        if matches!(status, LogStreamStatus::Unsealing | LogStreamStatus::Deleted) {
            return Err(RepositoryError::InvalidStatusTransition {
                log_stream_id: id,
                status,
                operation: "unregister",
            });
        }

        let topic_id = state.descriptor.topic_id;
        self.log_streams.remove(&id);
        if let Some(topic) = self.topics.get_mut(&topic_id) {
            topic.descriptor.log_streams.retain(|ls| *ls != id);
        }
        self.epoch += 1;
        info!(log_stream = %id, topic = %topic_id, "Unregistered log stream");
        Ok(MetadataResponse::Success)
    }

    /// Replace the replica set of a sealed log stream
    pub fn update_log_stream(
        &mut self,
        descriptor: LogStreamDescriptor,
    ) -> Result<MetadataResponse> {
        let id = descriptor.log_stream_id;
        let state = self
            .log_streams
            .get(&id)
            .ok_or(RepositoryError::LogStreamNotFound(id))?;
        if state.status() != LogStreamStatus::Sealed {
            return Err(RepositoryError::InvalidStatusTransition {
                log_stream_id: id,
                status: state.status(),
                operation: "update",
            });
        }
        if state.descriptor.topic_id != descriptor.topic_id {
            return Err(RepositoryError::invalid_replicas(
                id,
                format!(
                    "log stream belongs to topic {}, not {}",
                    state.descriptor.topic_id, descriptor.topic_id
                ),
            ));
        }
        self.validate_replicas(&descriptor)?;

        let replicas = descriptor.replicas;
        let Some(state) = self.log_streams.get_mut(&id) else {
            return Err(RepositoryError::LogStreamNotFound(id));
        };
        let keep: BTreeSet<StorageNodeId> = replicas.iter().map(|r| r.storage_node_id).collect();
        state.reports.retain(|sn, _| keep.contains(sn));
        state.descriptor.replicas = replicas;
        let updated = state.descriptor.clone();
        self.epoch += 1;
        info!(log_stream = %id, replicas = ?updated.replica_ids(), "Updated log stream replicas");
        Ok(MetadataResponse::LogStream(updated))
    }

    fn validate_replicas(&self, descriptor: &LogStreamDescriptor) -> Result<()> {
        let id = descriptor.log_stream_id;
        let voters = descriptor.voters().count();
        if voters != self.replication_factor {
            return Err(RepositoryError::invalid_replicas(
                id,
                format!(
                    "expected {} replicas, got {}",
                    self.replication_factor, voters
                ),
            ));
        }

        let mut seen = BTreeSet::new();
        for replica in &descriptor.replicas {
            if !seen.insert(replica.storage_node_id) {
                return Err(RepositoryError::invalid_replicas(
                    id,
                    format!("duplicate storage node {}", replica.storage_node_id),
                ));
            }
            if !self.storage_nodes.contains_key(&replica.storage_node_id) {
                return Err(RepositoryError::StorageNodeNotFound(
                    replica.storage_node_id,
                ));
            }
        }
        Ok(())
    }

    // ==================== Sealing ====================

    /// Move a log stream towards Sealed and return its last committed LLSN
    pub fn seal_log_stream(&mut self, id: LogStreamId) -> Result<MetadataResponse> {
        let committed_end = self.committed_llsn_end(id);
        let last_version = self.last_nonempty_commit_version(id);
        let state = self
            .log_streams
            .get_mut(&id)
            .ok_or(RepositoryError::LogStreamNotFound(id))?;

        sealing::begin_seal(state)?;
        sealing::reconcile(state, committed_end, last_version);

        Ok(MetadataResponse::Sealed {
            status: state.status(),
            last_committed_llsn: committed_end.saturating_sub(1),
        })
    }

    /// Move a sealed log stream towards Running
    pub fn unseal_log_stream(&mut self, id: LogStreamId) -> Result<MetadataResponse> {
        let committed_end = self.committed_llsn_end(id);
        let last_version = self.last_nonempty_commit_version(id);
        let state = self
            .log_streams
            .get_mut(&id)
            .ok_or(RepositoryError::LogStreamNotFound(id))?;

        sealing::begin_unseal(state)?;
        sealing::reconcile(state, committed_end, last_version);

        Ok(MetadataResponse::LogStream(state.descriptor.clone()))
    }

    // ==================== Reports ====================

    fn apply_reports(&mut self, reports: &[StorageNodeReport]) -> MetadataResponse {
        let mut updated = 0;
        for node_report in reports {
            for report in &node_report.reports {
                if self.update_report(report) {
                    updated += 1;
                }
            }
        }
        MetadataResponse::ReportsApplied { updated }
    }

    /// Whether [`update_report`](Self::update_report) would accept `report`
    pub fn would_accept_report(&self, report: &UncommittedReport) -> bool {
        if report.version > self.last_version() {
            return false;
        }
        let Some(state) = self.log_streams.get(&report.log_stream_id) else {
            return false;
        };
        if !state.descriptor.has_replica(report.storage_node_id) {
            return false;
        }
        match state.reports.get(&report.storage_node_id) {
            None => true,
            Some(prev) => report_supersedes(state.status(), prev, report),
        }
    }

    /// Record a replica report if it is newer than the stored one
    ///
    /// Returns whether the report was accepted.
    pub fn update_report(&mut self, report: &UncommittedReport) -> bool {
        if !self.would_accept_report(report) {
            if report.version > self.last_version() {
                warn!(
                    log_stream = %report.log_stream_id,
                    storage_node = %report.storage_node_id,
                    version = %report.version,
                    last_version = %self.last_version(),
                    "Ignoring report from the future"
                );
            } else {
                trace!(
                    log_stream = %report.log_stream_id,
                    storage_node = %report.storage_node_id,
                    "Ignoring stale report"
                );
            }
            return false;
        }

        let committed_end = self.committed_llsn_end(report.log_stream_id);
        let last_commit_version = self.last_nonempty_commit_version(report.log_stream_id);
        let Some(state) = self.log_streams.get_mut(&report.log_stream_id) else {
            return false;
        };
        state.reports.insert(report.storage_node_id, *report);
        if let Some(status) = sealing::reconcile(state, committed_end, last_commit_version) {
            info!(
                log_stream = %report.log_stream_id,
                status = %status,
                "Log stream status reconciled"
            );
        }
        true
    }

    /// Latest accepted report per replica
    pub fn lookup_uncommit_reports(
        &self,
        id: LogStreamId,
    ) -> Option<&BTreeMap<StorageNodeId, UncommittedReport>> {
        self.log_streams.get(&id).map(|ls| &ls.reports)
    }

    /// Lowest version reported by any replica; missing reports count as `INVALID`
    pub fn min_reported_version(&self) -> Version {
        let mut min: Option<Version> = None;
        for ls in self.log_streams.values() {
            for replica in &ls.descriptor.replicas {
                let v = ls
                    .reports
                    .get(&replica.storage_node_id)
                    .map(|r| r.version)
                    .unwrap_or(Version::INVALID);
                min = Some(min.map_or(v, |m| m.min(v)));
            }
        }
        min.unwrap_or_else(|| self.last_version())
    }

    // ==================== Commit History ====================

    /// Compute the round following `base_version` and append it
    ///
    /// Once the history outgrows [`COMMIT_HISTORY_RETENTION`] it is trimmed
    /// to the lowest reported version. Only replicated state decides this.
    pub fn commit(&mut self, base_version: Version) -> Result<MetadataResponse> {
        let last = self.last_version();
        if last != base_version {
            return Err(RepositoryError::StaleVersion {
                expected: base_version,
                actual: last,
            });
        }

        match calculator::build_commit_round(self) {
            Some(round) => {
                let version = round.version;
                self.apply_commit_results(base_version, round)?;
                if self.commit_history.len() > COMMIT_HISTORY_RETENTION {
                    let min_version = self.min_reported_version();
                    self.trim_commit_history(min_version);
                }
                Ok(MetadataResponse::Committed { version })
            }
            None => Ok(MetadataResponse::NoCommit),
        }
    }

    /// Append one round; rejected without partial apply on a version mismatch
    pub fn apply_commit_results(
        &mut self,
        base_version: Version,
        round: CommitRound,
    ) -> Result<()> {
        let last = self.last_version();
        if last != base_version {
            return Err(RepositoryError::StaleVersion {
                expected: base_version,
                actual: last,
            });
        }
        if round.version != base_version.next() {
            return Err(RepositoryError::StaleVersion {
                expected: base_version.next(),
                actual: round.version,
            });
        }

        for result in &round.results {
            if let Some(topic) = self.topics.get_mut(&result.topic_id) {
                topic.high_watermark = topic.high_watermark.max(result.high_watermark);
            }
            if result.is_empty() {
                continue;
            }
            if let Some(ls) = self.log_streams.get_mut(&result.log_stream_id) {
                ls.committed_end = ls.committed_end.max(result.committed_llsn_end());
                ls.last_commit_version = result.version;
            }
        }
        debug!(
            version = %round.version,
            committed = round.total_committed(),
            log_streams = round.results.len(),
            "Appended commit round"
        );
        self.commit_history.push_back(round);
        Ok(())
    }

    /// Version of the most recent round
    pub fn last_version(&self) -> Version {
        self.commit_history
            .back()
            .map(|r| r.version)
            .unwrap_or(Version::INVALID)
    }

    pub fn last_commit_results(&self) -> Option<&CommitRound> {
        self.commit_history.back()
    }

    /// First retained round with a version greater than `from`
    pub fn lookup_next_commit_results(&self, from: Version) -> Option<&CommitRound> {
        let first = self.commit_history.front()?.version;
        if from < first {
            return self.commit_history.front();
        }
        let idx = (from.get() - first.get()).checked_add(1)?;
        self.commit_history.get(usize::try_from(idx).ok()?)
    }

    /// Round with exactly `version`
    pub fn commit_results_at(&self, version: Version) -> Option<&CommitRound> {
        let first = self.commit_history.front()?.version;
        if version < first {
            return None;
        }
        self.commit_history
            .get(usize::try_from(version.get() - first.get()).ok()?)
    }

    /// Result of one log stream in one version
    pub fn commit_result(&self, id: LogStreamId, version: Version) -> Option<&CommitResult> {
        let round = self.commit_results_at(version)?;
        self.find_in_round(round, id)
    }

    /// Latest result of a log stream
    pub fn last_commit_result(&self, id: LogStreamId) -> Option<&CommitResult> {
        let round = self.commit_history.back()?;
        self.find_in_round(round, id)
    }

    /// Non-empty results of a log stream newer than `after`, plus the latest one
    pub fn commit_results_since(&self, id: LogStreamId, after: Version) -> Vec<CommitResult> {
        let mut results: Vec<CommitResult> = self
            .commit_history
            .iter()
            .filter(|round| round.version > after)
            .filter_map(|round| self.find_in_round(round, id))
            .filter(|r| !r.is_empty())
            .copied()
            .collect();

        if let Some(latest) = self.last_commit_result(id) {
            if latest.version > after && results.last() != Some(latest) {
                results.push(*latest);
            }
        }
        results
    }

    /// One past the last committed LLSN of a log stream
    pub fn committed_llsn_end(&self, id: LogStreamId) -> Llsn {
        self.log_streams
            .get(&id)
            .map_or(Llsn::MIN, |ls| ls.committed_end)
    }

    /// Version of the newest round that committed entries of `id`
    pub fn last_nonempty_commit_version(&self, id: LogStreamId) -> Version {
        self.log_streams
            .get(&id)
            .map_or(Version::INVALID, |ls| ls.last_commit_version)
    }

    fn find_in_round<'a>(
        &self,
        round: &'a CommitRound,
        id: LogStreamId,
    ) -> Option<&'a CommitResult> {
        match self.log_streams.get(&id) {
            Some(ls) => round.find(ls.descriptor.topic_id, id),
            None => round.find_log_stream(id),
        }
    }

    /// Drop rounds no replica can still reference; the latest round is always kept
    ///
    /// Returns the number of rounds removed.
    pub fn trim_commit_history(&mut self, min_version: Version) -> usize {
        let mut removed = 0;
        while self.commit_history.len() > 1 {
            match self.commit_history.front() {
                Some(round) if round.version <= min_version => {
                    self.commit_history.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }
        if removed > 0 {
            debug!(removed, min_version = %min_version, "Trimmed commit history");
        }
        removed
    }

    // ==================== Membership ====================

    fn add_peer(&mut self, peer: PeerInfo) -> Result<MetadataResponse> {
        info!(node_index = peer.node_index, url = %peer.url, "Added peer");
        self.peers.insert(peer.node_index, peer);
        Ok(MetadataResponse::Success)
    }

    fn remove_peer(&mut self, node_index: u64) -> Result<MetadataResponse> {
        self.peers
            .remove(&node_index)
            .ok_or(RepositoryError::PeerNotFound(node_index))?;
        info!(node_index, "Removed peer");
        Ok(MetadataResponse::Success)
    }

    // ==================== Queries ====================

    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNodeDescriptor> {
        self.storage_nodes.get(&id)
    }

    pub fn topic(&self, id: TopicId) -> Option<&TopicState> {
        self.topics.get(&id)
    }

    pub fn log_stream(&self, id: LogStreamId) -> Option<&LogStreamState> {
        self.log_streams.get(&id)
    }

    /// Log streams with a replica on the given storage node
    pub fn log_streams_on(&self, id: StorageNodeId) -> Vec<LogStreamId> {
        self.log_streams
            .values()
            .filter(|ls| ls.descriptor.has_replica(id))
            .map(|ls| ls.descriptor.log_stream_id)
            .collect()
    }

    /// Registry snapshot for `GetMetadata`
    pub fn metadata_descriptor(&self) -> MetadataDescriptor {
        MetadataDescriptor {
            applied_index: self.last_applied_index,
            storage_nodes: self.storage_nodes.values().cloned().collect(),
            topics: self.topics.values().map(|t| t.descriptor.clone()).collect(),
            log_streams: self
                .log_streams
                .values()
                .map(|ls| ls.descriptor.clone())
                .collect(),
        }
    }

    /// Serialize for snapshot
    pub fn serialize(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    /// Deserialize from snapshot
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| RepositoryError::Deserialization(e.to_string()))
    }
}

/// Whether `next` replaces `prev` as the stored report of one replica
///
/// Running log streams only move forward. Other states also accept a
/// shrinking range, which is how replicas truncate to the seal boundary.
fn report_supersedes(
    status: LogStreamStatus,
    prev: &UncommittedReport,
    next: &UncommittedReport,
) -> bool {
    if next.version < prev.version {
        return false;
    }
    if !status.is_running() {
        return next != prev;
    }

    let prev_end = prev.uncommitted_llsn_end();
    let next_end = next.uncommitted_llsn_end();
    next_end > prev_end
        || (next_end == prev_end && (next.version > prev.version || next.status != prev.status))
}

/// Thread-safe metadata store wrapper
#[derive(Clone)]
pub struct MetadataStore {
    metadata: Arc<RwLock<ClusterMetadata>>,
}

impl MetadataStore {
    pub fn new(replication_factor: usize) -> Self {
        Self::from_metadata(ClusterMetadata::new(replication_factor))
    }

    pub fn from_metadata(metadata: ClusterMetadata) -> Self {
        Self {
            metadata: Arc::new(RwLock::new(metadata)),
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, ClusterMetadata> {
        self.metadata.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, ClusterMetadata> {
        self.metadata.write().await
    }

    pub async fn apply(&self, index: u64, cmd: MetadataCommand) -> Result<MetadataResponse> {
        self.metadata.write().await.apply(index, cmd)
    }

    pub async fn get_log_stream(&self, id: LogStreamId) -> Option<LogStreamDescriptor> {
        self.metadata
            .read()
            .await
            .log_stream(id)
            .map(|ls| ls.descriptor.clone())
    }

    pub async fn last_version(&self) -> Version {
        self.metadata.read().await.last_version()
    }

    pub async fn epoch(&self) -> u64 {
        self.metadata.read().await.epoch
    }
}
