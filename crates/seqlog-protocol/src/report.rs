//! Replica reports and commit results
//!
//! Storage nodes periodically report how far each of their log stream
//! replicas has written ([`UncommittedReport`]). The metadata repository
//! answers with [`CommitResult`]s, grouped per version into a [`CommitRound`].

use crate::types::{Glsn, Llsn, LogStreamId, ReplicaStatus, StorageNodeId, TopicId, Version};
use serde::{Deserialize, Serialize};

/// Write progress of one log stream replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedReport {
    pub storage_node_id: StorageNodeId,
    pub log_stream_id: LogStreamId,
    /// Latest commit version the replica has applied
    pub version: Version,
    /// High watermark of the topic as of `version`
    pub high_watermark: Glsn,
    /// First LLSN written but not yet committed
    pub uncommitted_llsn_offset: Llsn,
    /// Number of uncommitted entries starting at `uncommitted_llsn_offset`
    pub uncommitted_llsn_length: u64,
    /// Replica-level status
    pub status: ReplicaStatus,
}

impl UncommittedReport {
    /// Empty report for a freshly created replica
    pub fn new(storage_node_id: StorageNodeId, log_stream_id: LogStreamId) -> Self {
        Self {
            storage_node_id,
            log_stream_id,
            version: Version::INVALID,
            high_watermark: Glsn::INVALID,
            uncommitted_llsn_offset: Llsn::MIN,
            uncommitted_llsn_length: 0,
            status: ReplicaStatus::Running,
        }
    }

    pub fn with_version(mut self, version: Version, high_watermark: Glsn) -> Self {
        self.version = version;
        self.high_watermark = high_watermark;
        self
    }

    pub fn with_uncommitted(mut self, offset: Llsn, length: u64) -> Self {
        self.uncommitted_llsn_offset = offset;
        self.uncommitted_llsn_length = length;
        self
    }

    pub fn with_status(mut self, status: ReplicaStatus) -> Self {
        self.status = status;
        self
    }

    /// One past the last uncommitted LLSN
    pub fn uncommitted_llsn_end(&self) -> Llsn {
        self.uncommitted_llsn_offset
            .advance(self.uncommitted_llsn_length)
    }

    /// Whether the replica has not applied any commit yet
    pub fn is_fresh(&self) -> bool {
        self.version.is_invalid()
    }
}

/// Everything one storage node reports in a single `GetReport` call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageNodeReport {
    pub storage_node_id: StorageNodeId,
    pub reports: Vec<UncommittedReport>,
}

impl StorageNodeReport {
    pub fn new(storage_node_id: StorageNodeId, reports: Vec<UncommittedReport>) -> Self {
        Self {
            storage_node_id,
            reports,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

/// Commit decision for one log stream in one version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    /// First LLSN committed in this version
    pub committed_llsn_offset: Llsn,
    /// GLSN assigned to `committed_llsn_offset`
    pub committed_glsn_offset: Glsn,
    /// Number of entries committed (may be zero)
    pub committed_glsn_length: u64,
    pub version: Version,
    /// Last GLSN assigned in the topic as of `version`
    pub high_watermark: Glsn,
}

impl CommitResult {
    pub fn committed_llsn_end(&self) -> Llsn {
        self.committed_llsn_offset
            .advance(self.committed_glsn_length)
    }

    pub fn committed_glsn_end(&self) -> Glsn {
        self.committed_glsn_offset
            .advance(self.committed_glsn_length)
    }

    pub fn is_empty(&self) -> bool {
        self.committed_glsn_length == 0
    }
}

/// All commit results sharing one version, sorted by `(topic_id, log_stream_id)`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitRound {
    pub version: Version,
    pub results: Vec<CommitResult>,
}

impl CommitRound {
    pub fn new(version: Version, mut results: Vec<CommitResult>) -> Self {
        results.sort_by_key(|r| (r.topic_id, r.log_stream_id));
        Self { version, results }
    }

    /// Binary search by `(topic_id, log_stream_id)`
    pub fn find(&self, topic_id: TopicId, log_stream_id: LogStreamId) -> Option<&CommitResult> {
        self.results
            .binary_search_by_key(&(topic_id, log_stream_id), |r| {
                (r.topic_id, r.log_stream_id)
            })
            .ok()
            .map(|idx| &self.results[idx])
    }

    /// Linear lookup when the topic is unknown
    pub fn find_log_stream(&self, log_stream_id: LogStreamId) -> Option<&CommitResult> {
        self.results
            .iter()
            .find(|r| r.log_stream_id == log_stream_id)
    }

    /// Total entries committed across all log streams
    pub fn total_committed(&self) -> u64 {
        self.results.iter().map(|r| r.committed_glsn_length).sum()
    }

    /// High watermark of a topic as of this round
    pub fn high_watermark(&self, topic_id: TopicId) -> Option<Glsn> {
        self.results
            .iter()
            .find(|r| r.topic_id == topic_id)
            .map(|r| r.high_watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(topic: u32, ls: u32, llsn: u64, glsn: u64, len: u64) -> CommitResult {
        CommitResult {
            topic_id: TopicId(topic),
            log_stream_id: LogStreamId(ls),
            committed_llsn_offset: Llsn(llsn),
            committed_glsn_offset: Glsn(glsn),
            committed_glsn_length: len,
            version: Version(1),
            high_watermark: Glsn(glsn + len - 1),
        }
    }

    #[test]
    fn test_uncommitted_end() {
        let report = UncommittedReport::new(StorageNodeId(1), LogStreamId(1))
            .with_uncommitted(Llsn(5), 3);
        assert_eq!(report.uncommitted_llsn_end(), Llsn(8));
        assert!(report.is_fresh());
    }

    #[test]
    fn test_commit_round_sorted_lookup() {
        let round = CommitRound::new(
            Version(1),
            vec![
                result(2, 1, 1, 1, 2),
                result(1, 3, 1, 3, 1),
                result(1, 2, 1, 1, 2),
            ],
        );
        let keys: Vec<_> = round
            .results
            .iter()
            .map(|r| (r.topic_id.0, r.log_stream_id.0))
            .collect();
        assert_eq!(keys, vec![(1, 2), (1, 3), (2, 1)]);
        assert_eq!(
            round.find(TopicId(1), LogStreamId(3)).map(|r| r.committed_glsn_offset),
            Some(Glsn(3))
        );
        assert!(round.find(TopicId(2), LogStreamId(3)).is_none());
        assert_eq!(round.total_committed(), 5);
    }

    #[test]
    fn test_commit_result_ends() {
        let r = result(1, 1, 4, 10, 3);
        assert_eq!(r.committed_llsn_end(), Llsn(7));
        assert_eq!(r.committed_glsn_end(), Glsn(13));
        assert!(!r.is_empty());
    }
}
