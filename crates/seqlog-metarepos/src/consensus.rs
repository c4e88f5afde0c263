//! Consensus log contract
//!
//! The repository needs four things from a consensus implementation: a
//! best-effort `propose`, an in-order stream of committed entries, a place
//! to keep snapshots, and membership changes. [`ConsensusLog`] captures
//! exactly that; election and replication mechanics stay behind it.
//!
//! [`MemoryCluster`] is an in-process log shared by several repository
//! replicas. Besides normal operation it can stall commits, change
//! leadership (dropping uncommitted proposals), commit proposals from a
//! previous term late, and disconnect nodes.

use crate::error::{RepositoryError, Result};
use crate::snapshot::{MemorySnapshotStore, SnapshotData, SnapshotStore};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One committed log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub data: Bytes,
}

/// Application-level view of a replicated log
#[async_trait]
pub trait ConsensusLog: Send + Sync + 'static {
    /// Index of this replica in the group
    fn node_index(&self) -> u64;

    /// Submit an entry; it may never commit (leader change, partition)
    async fn propose(&self, data: Bytes) -> Result<()>;

    /// Committed entries with index greater than `after_index`, in order
    async fn open(&self, after_index: u64) -> Result<mpsc::UnboundedReceiver<LogEntry>>;

    /// Persist a snapshot; entries up to its index may be discarded
    async fn save_snapshot(&self, snapshot: &SnapshotData) -> Result<()>;

    /// Latest persisted snapshot of this replica
    async fn load_snapshot(&self) -> Result<Option<SnapshotData>>;

    fn is_leader(&self) -> bool;

    fn leader(&self) -> Option<u64>;

    /// Current members of the group
    fn members(&self) -> Vec<u64>;

    async fn add_peer(&self, node_index: u64, url: &str) -> Result<()>;

    async fn remove_peer(&self, node_index: u64) -> Result<()>;
}

struct Member {
    url: String,
    subscriber: Option<mpsc::UnboundedSender<LogEntry>>,
    connected: bool,
    snapshots: Arc<dyn SnapshotStore>,
}

struct ClusterState {
    entries: Vec<LogEntry>,
    /// Entries up to this index were discarded
    compacted: u64,
    /// Proposals accepted while commits are stalled
    pending: Vec<Bytes>,
    stalled: bool,
    leader: Option<u64>,
    term: u64,
    members: BTreeMap<u64, Member>,
}

impl ClusterState {
    fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.compacted)
    }

    fn commit(&mut self, data: Bytes) -> u64 {
        let entry = LogEntry {
            index: self.last_index() + 1,
            data,
        };
        let index = entry.index;
        for member in self.members.values_mut() {
            if let Some(tx) = &member.subscriber {
                if tx.send(entry.clone()).is_err() {
                    member.subscriber = None;
                }
            }
        }
        self.entries.push(entry);
        index
    }
}

/// In-process replicated log
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    /// Create a group; the first member starts as leader
    pub fn new(members: &[u64]) -> Self {
        let members = members
            .iter()
            .map(|idx| {
                (
                    *idx,
                    Member {
                        url: format!("memory://{}", idx),
                        subscriber: None,
                        connected: true,
                        snapshots: Arc::new(MemorySnapshotStore::new()),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        let leader = members.keys().next().copied();

        Self {
            state: Arc::new(Mutex::new(ClusterState {
                entries: Vec::new(),
                compacted: 0,
                pending: Vec::new(),
                stalled: false,
                leader,
                term: 1,
                members,
            })),
        }
    }

    /// Single-member group
    pub fn standalone() -> Self {
        Self::new(&[1])
    }

    /// Handle for one member (reconnects it if it was disconnected)
    pub fn node(&self, node_index: u64) -> MemoryConsensus {
        let mut state = self.state.lock();
        let member = state.members.entry(node_index).or_insert_with(|| Member {
            url: format!("memory://{}", node_index),
            subscriber: None,
            connected: true,
            snapshots: Arc::new(MemorySnapshotStore::new()),
        });
        member.connected = true;
        MemoryConsensus {
            cluster: self.clone(),
            node_index,
        }
    }

    /// Replace the snapshot store of a member
    pub fn set_snapshot_store(&self, node_index: u64, store: Arc<dyn SnapshotStore>) {
        if let Some(member) = self.state.lock().members.get_mut(&node_index) {
            member.snapshots = store;
        }
    }

    /// Accept proposals but stop committing them
    pub fn stall(&self) {
        self.state.lock().stalled = true;
    }

    /// Commit proposals accepted while stalled, in order, and continue normally
    pub fn commit_stalled(&self) {
        let mut state = self.state.lock();
        state.stalled = false;
        let pending = std::mem::take(&mut state.pending);
        for data in pending {
            state.commit(data);
        }
    }

    /// Change leader; proposals not yet committed are lost
    pub fn elect(&self, node_index: u64) {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        state.stalled = false;
        state.term += 1;
        state.leader = Some(node_index);
        info!(leader = node_index, term = state.term, dropped, "Leader elected");
    }

    /// Crash a member: its entry stream ends and its proposals fail
    pub fn disconnect(&self, node_index: u64) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.get_mut(&node_index) {
            member.connected = false;
            member.subscriber = None;
        }
        if state.leader == Some(node_index) {
            state.leader = None;
        }
        warn!(node_index, "Member disconnected");
    }

    /// Discard entries up to `index`
    pub fn compact(&self, index: u64) {
        let mut state = self.state.lock();
        let index = index.min(state.last_index());
        state.entries.retain(|e| e.index > index);
        state.compacted = state.compacted.max(index);
        debug!(compacted = state.compacted, "Compacted log");
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index()
    }

    pub fn url(&self, node_index: u64) -> Option<String> {
        self.state
            .lock()
            .members
            .get(&node_index)
            .map(|m| m.url.clone())
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }
}

/// One member's handle on a [`MemoryCluster`]
pub struct MemoryConsensus {
    cluster: MemoryCluster,
    node_index: u64,
}

impl MemoryConsensus {
    fn snapshots(&self) -> Result<Arc<dyn SnapshotStore>> {
        self.cluster
            .state
            .lock()
            .members
            .get(&self.node_index)
            .map(|m| Arc::clone(&m.snapshots))
            .ok_or_else(|| RepositoryError::Consensus(format!("node {} removed", self.node_index)))
    }

    fn connected(&self, state: &ClusterState) -> bool {
        state
            .members
            .get(&self.node_index)
            .is_some_and(|m| m.connected)
    }
}

#[async_trait]
impl ConsensusLog for MemoryConsensus {
    fn node_index(&self) -> u64 {
        self.node_index
    }

    async fn propose(&self, data: Bytes) -> Result<()> {
        let mut state = self.cluster.state.lock();
        if !self.connected(&state) {
            return Err(RepositoryError::Consensus(format!(
                "node {} is disconnected",
                self.node_index
            )));
        }
        if state.leader.is_none() {
            // Nobody to forward to; the proposal is lost
            return Ok(());
        }
        if state.stalled {
            state.pending.push(data);
        } else {
            state.commit(data);
        }
        Ok(())
    }

    async fn open(&self, after_index: u64) -> Result<mpsc::UnboundedReceiver<LogEntry>> {
        let mut state = self.cluster.state.lock();
        if !self.connected(&state) {
            return Err(RepositoryError::Consensus(format!(
                "node {} is disconnected",
                self.node_index
            )));
        }
        if after_index < state.compacted {
            return Err(RepositoryError::Consensus(format!(
                "log compacted to {}, cannot replay from {}",
                state.compacted, after_index
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for entry in state.entries.iter().filter(|e| e.index > after_index) {
            tx.send(entry.clone())?;
        }
        if let Some(member) = state.members.get_mut(&self.node_index) {
            member.subscriber = Some(tx);
        }
        Ok(rx)
    }

    async fn save_snapshot(&self, snapshot: &SnapshotData) -> Result<()> {
        self.snapshots()?.save(snapshot).await
    }

    async fn load_snapshot(&self) -> Result<Option<SnapshotData>> {
        self.snapshots()?.load_latest().await
    }

    fn is_leader(&self) -> bool {
        let state = self.cluster.state.lock();
        state.leader == Some(self.node_index) && self.connected(&state)
    }

    fn leader(&self) -> Option<u64> {
        self.cluster.state.lock().leader
    }

    fn members(&self) -> Vec<u64> {
        self.cluster.state.lock().members.keys().copied().collect()
    }

    async fn add_peer(&self, node_index: u64, url: &str) -> Result<()> {
        let mut state = self.cluster.state.lock();
        let member = state.members.entry(node_index).or_insert_with(|| Member {
            url: url.to_string(),
            subscriber: None,
            connected: true,
            snapshots: Arc::new(MemorySnapshotStore::new()),
        });
        member.url = url.to_string();
        Ok(())
    }

    async fn remove_peer(&self, node_index: u64) -> Result<()> {
        let mut state = self.cluster.state.lock();
        if state.members.remove(&node_index).is_none() {
            return Err(RepositoryError::PeerNotFound(node_index));
        }
        if state.leader == Some(node_index) {
            state.leader = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::UnboundedReceiver<LogEntry>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            out.push(entry.index);
        }
        out
    }

    #[tokio::test]
    async fn test_entries_reach_every_member_in_order() {
        let cluster = MemoryCluster::new(&[1, 2]);
        let a = cluster.node(1);
        let b = cluster.node(2);
        let mut rx_a = a.open(0).await.unwrap();
        let mut rx_b = b.open(0).await.unwrap();

        a.propose(Bytes::from_static(b"x")).await.unwrap();
        b.propose(Bytes::from_static(b"y")).await.unwrap();

        assert_eq!(drain(&mut rx_a).await, vec![1, 2]);
        assert_eq!(drain(&mut rx_b).await, vec![1, 2]);
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn test_election_drops_pending_proposals() {
        let cluster = MemoryCluster::new(&[1, 2]);
        let a = cluster.node(1);
        let mut rx = a.open(0).await.unwrap();

        cluster.stall();
        a.propose(Bytes::from_static(b"lost")).await.unwrap();
        assert!(drain(&mut rx).await.is_empty());

        cluster.elect(2);
        assert_eq!(cluster.leader_for_test(), Some(2));
        a.propose(Bytes::from_static(b"kept")).await.unwrap();
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.data, Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn test_commit_stalled_applies_late() {
        let cluster = MemoryCluster::standalone();
        let a = cluster.node(1);
        let mut rx = a.open(0).await.unwrap();

        cluster.stall();
        a.propose(Bytes::from_static(b"late")).await.unwrap();
        cluster.commit_stalled();
        assert_eq!(drain(&mut rx).await, vec![1]);
    }

    #[tokio::test]
    async fn test_open_replays_and_respects_compaction() {
        let cluster = MemoryCluster::standalone();
        let a = cluster.node(1);
        for _ in 0..4 {
            a.propose(Bytes::from_static(b"e")).await.unwrap();
        }
        let mut rx = a.open(2).await.unwrap();
        assert_eq!(drain(&mut rx).await, vec![3, 4]);

        cluster.compact(3);
        assert!(a.open(1).await.is_err());
        let mut rx = a.open(3).await.unwrap();
        assert_eq!(drain(&mut rx).await, vec![4]);
    }

    #[tokio::test]
    async fn test_disconnected_member() {
        let cluster = MemoryCluster::standalone();
        let a = cluster.node(1);
        let mut rx = a.open(0).await.unwrap();
        cluster.disconnect(1);

        assert!(a.propose(Bytes::from_static(b"x")).await.is_err());
        assert!(rx.recv().await.is_none());
        assert!(!a.is_leader());
    }

    impl MemoryCluster {
        fn leader_for_test(&self) -> Option<u64> {
            self.state.lock().leader
        }
    }
}
