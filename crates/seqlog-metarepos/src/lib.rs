//! # Seqlog Metadata Repository
//!
//! Consensus-backed sequencing engine for a replicated, ordered log:
//! - **Report collection**: per-storage-node executors poll how far every
//!   log stream replica has written
//! - **Commit calculation**: the prefix every replica holds gets a contiguous
//!   range of global positions (GLSNs), one round per version
//! - **Replicated state machine**: registry changes, reports and commit
//!   rounds are all entries of one consensus log, applied in order on every
//!   replica
//! - **Sealing**: log streams stop at a boundary all replicas agree on
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Metadata Repository Replica                 │
//! ├───────────────┬────────────────────┬─────────────────────────┤
//! │   Collector   │    Apply Loop      │   Request Surface       │
//! ├───────────────┼────────────────────┼─────────────────────────┤
//! │ • GetReport   │ • Registry         │ • Register / Unregister │
//! │ • Commit push │ • Reports          │ • Seal / Unseal         │
//! │ • Backoff     │ • Commit rounds    │ • GetMetadata           │
//! │ • Staleness   │ • Snapshots        │ • Commit results        │
//! └───────────────┴────────────────────┴─────────────────────────┘
//!                 ▲ committed entries  │ proposals
//!                 └──── ConsensusLog ◀─┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use seqlog_metarepos::{MemoryCluster, MetadataRepository, RepositoryConfig};
//!
//! let cluster = MemoryCluster::standalone();
//! let repo = MetadataRepository::start(
//!     RepositoryConfig::default(),
//!     Arc::new(cluster.node(1)),
//!     Arc::new(MyStorageNodeClients::new()),
//! )
//! .await?;
//!
//! let sn = StorageNodeId(1);
//! repo.register_storage_node(StorageNodeDescriptor::new(sn, "sn-1:9091")).await?;
//! repo.register_topic(TopicId(1)).await?;
//! repo.register_log_stream(LogStreamDescriptor::new(TopicId(1), LogStreamId(1), [sn]))
//!     .await?;
//! ```

mod apply;
pub mod calculator;
pub mod collector;
pub mod config;
pub mod consensus;
pub mod error;
pub mod locks;
pub mod metadata;
pub mod observability;
pub mod protocol;
pub mod repository;
pub mod requests;
pub mod sealing;
pub mod snapshot;
mod ticker;

// Re-export main types
pub use calculator::{build_commit_round, calculate_commit, CommitDecision};
pub use collector::{ReportCollector, StorageNodeClient, StorageNodeClientFactory};
pub use config::{CollectorConfig, RepositoryConfig, RepositoryConfigBuilder};
pub use consensus::{ConsensusLog, LogEntry, MemoryCluster, MemoryConsensus};
pub use error::{RepositoryError, Result};
pub use metadata::{ClusterMetadata, MetadataCommand, MetadataResponse, MetadataStore};
pub use observability::{init_metrics, CollectorMetrics, RepositoryMetrics};
pub use protocol::{Proposal, ProposalTag};
pub use repository::MetadataRepository;
pub use snapshot::{
    open_snapshot_store, FileSnapshotStore, MemorySnapshotStore, SnapshotData, SnapshotStore,
};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::repository::MetadataRepository;
    pub use seqlog_protocol::{
        CommitResult, CommitRound, Glsn, Llsn, LogStreamDescriptor, LogStreamId, LogStreamStatus,
        StorageNodeDescriptor, StorageNodeId, StorageNodeReport, TopicId, UncommittedReport,
        Version,
    };
}
