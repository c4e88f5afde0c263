//! Registry descriptors returned by `GetMetadata`

use crate::types::{
    LogStreamId, LogStreamStatus, StorageNodeId, StorageNodeStatus, TopicId, TopicStatus, Version,
};
use serde::{Deserialize, Serialize};

/// Storage node registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeDescriptor {
    pub storage_node_id: StorageNodeId,
    /// Address the repository dials for `GetReport`/`Commit`
    pub address: String,
    pub status: StorageNodeStatus,
}

impl StorageNodeDescriptor {
    pub fn new(storage_node_id: StorageNodeId, address: impl Into<String>) -> Self {
        Self {
            storage_node_id,
            address: address.into(),
            status: StorageNodeStatus::Running,
        }
    }
}

/// Topic registration and the log streams that belong to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub topic_id: TopicId,
    pub status: TopicStatus,
    /// Sorted ascending
    pub log_streams: Vec<LogStreamId>,
}

impl TopicDescriptor {
    pub fn new(topic_id: TopicId) -> Self {
        Self {
            topic_id,
            status: TopicStatus::Running,
            log_streams: Vec::new(),
        }
    }
}

/// One replica of a log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub storage_node_id: StorageNodeId,
    /// Learners receive commits but do not gate them
    #[serde(default)]
    pub learner: bool,
}

impl ReplicaDescriptor {
    pub fn new(storage_node_id: StorageNodeId) -> Self {
        Self {
            storage_node_id,
            learner: false,
        }
    }

    pub fn learner(storage_node_id: StorageNodeId) -> Self {
        Self {
            storage_node_id,
            learner: true,
        }
    }
}

/// Log stream registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamDescriptor {
    pub topic_id: TopicId,
    pub log_stream_id: LogStreamId,
    pub status: LogStreamStatus,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl LogStreamDescriptor {
    pub fn new(
        topic_id: TopicId,
        log_stream_id: LogStreamId,
        replicas: impl IntoIterator<Item = StorageNodeId>,
    ) -> Self {
        Self {
            topic_id,
            log_stream_id,
            status: LogStreamStatus::Running,
            replicas: replicas.into_iter().map(ReplicaDescriptor::new).collect(),
        }
    }

    /// Replicas that gate commits
    pub fn voters(&self) -> impl Iterator<Item = &ReplicaDescriptor> {
        self.replicas.iter().filter(|r| !r.learner)
    }

    pub fn has_replica(&self, storage_node_id: StorageNodeId) -> bool {
        self.replicas
            .iter()
            .any(|r| r.storage_node_id == storage_node_id)
    }

    pub fn replica_ids(&self) -> Vec<StorageNodeId> {
        self.replicas.iter().map(|r| r.storage_node_id).collect()
    }
}

/// Snapshot of the registry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetadataDescriptor {
    /// Index of the last applied consensus entry reflected here
    pub applied_index: u64,
    pub storage_nodes: Vec<StorageNodeDescriptor>,
    pub topics: Vec<TopicDescriptor>,
    pub log_streams: Vec<LogStreamDescriptor>,
}

impl MetadataDescriptor {
    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNodeDescriptor> {
        self.storage_nodes.iter().find(|d| d.storage_node_id == id)
    }

    pub fn topic(&self, id: TopicId) -> Option<&TopicDescriptor> {
        self.topics.iter().find(|d| d.topic_id == id)
    }

    pub fn log_stream(&self, id: LogStreamId) -> Option<&LogStreamDescriptor> {
        self.log_streams.iter().find(|d| d.log_stream_id == id)
    }
}

/// Member of the metadata repository consensus group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_index: u64,
    pub url: String,
}

/// Response of `GetClusterInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: u32,
    pub node_index: u64,
    pub leader: Option<u64>,
    pub replication_factor: usize,
    pub applied_index: u64,
    pub last_version: Version,
    pub peers: Vec<PeerInfo>,
}
