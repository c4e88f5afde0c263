//! Metadata repository error types

use seqlog_protocol::{
    LogStreamId, LogStreamStatus, ProtocolError, StorageNodeId, TopicId, Version,
};
use thiserror::Error;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Metadata repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Validation Errors ====================
    #[error("storage node already exists: {0}")]
    StorageNodeAlreadyExists(StorageNodeId),

    #[error("storage node not found: {0}")]
    StorageNodeNotFound(StorageNodeId),

    #[error("storage node {storage_node_id} still hosts log stream {log_stream_id}")]
    StorageNodeInUse {
        storage_node_id: StorageNodeId,
        log_stream_id: LogStreamId,
    },

    #[error("topic already exists: {0}")]
    TopicAlreadyExists(TopicId),

    #[error("topic not found: {0}")]
    TopicNotFound(TopicId),

    #[error("log stream already exists: {0}")]
    LogStreamAlreadyExists(LogStreamId),

    #[error("log stream not found: {0}")]
    LogStreamNotFound(LogStreamId),

    #[error("invalid replicas for log stream {log_stream_id}: {reason}")]
    InvalidReplicas {
        log_stream_id: LogStreamId,
        reason: String,
    },

    #[error("log stream {log_stream_id}: cannot {operation} while {status}")]
    InvalidStatusTransition {
        log_stream_id: LogStreamId,
        status: LogStreamStatus,
        operation: &'static str,
    },

    #[error("peer not found: {0}")]
    PeerNotFound(u64),

    // ==================== Commit Errors ====================
    #[error("stale commit round: expected base version {expected}, store is at {actual}")]
    StaleVersion { expected: Version, actual: Version },

    // ==================== Consensus Errors ====================
    #[error("not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Storage Node Errors ====================
    #[error("storage node {storage_node_id} rpc failed: {message}")]
    Rpc {
        storage_node_id: StorageNodeId,
        message: String,
    },

    // ==================== Storage Errors ====================
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("unexpected response to {operation}")]
    UnexpectedResponse { operation: &'static str },

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl RepositoryError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RepositoryError::DeadlineExceeded
                | RepositoryError::NotLeader { .. }
                | RepositoryError::Rpc { .. }
                | RepositoryError::StaleVersion { .. }
        )
    }

    /// Check if this error was raised by request validation (no state changed)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RepositoryError::StorageNodeAlreadyExists(_)
                | RepositoryError::StorageNodeNotFound(_)
                | RepositoryError::StorageNodeInUse { .. }
                | RepositoryError::TopicAlreadyExists(_)
                | RepositoryError::TopicNotFound(_)
                | RepositoryError::LogStreamAlreadyExists(_)
                | RepositoryError::LogStreamNotFound(_)
                | RepositoryError::InvalidReplicas { .. }
                | RepositoryError::InvalidStatusTransition { .. }
                | RepositoryError::PeerNotFound(_)
        )
    }

    /// Check if this is a fatal error requiring the replica to stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RepositoryError::CorruptData(_) | RepositoryError::Fatal(_)
        )
    }

    pub(crate) fn invalid_replicas(log_stream_id: LogStreamId, reason: impl Into<String>) -> Self {
        RepositoryError::InvalidReplicas {
            log_stream_id,
            reason: reason.into(),
        }
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RepositoryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RepositoryError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RepositoryError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RepositoryError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for RepositoryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RepositoryError::DeadlineExceeded
    }
}

// Conversion from postcard for serialization
impl From<postcard::Error> for RepositoryError {
    fn from(e: postcard::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}
