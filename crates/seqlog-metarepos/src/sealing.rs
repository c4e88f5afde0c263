//! Log stream status transitions
//!
//! ```text
//!   Running ──seal──▶ Sealing ──all replicas sealed──▶ Sealed
//!      ▲                 │                               │
//!      │                 └──────────unseal───────────────┤
//!      │                                                 ▼
//!      └────────────all replicas running──────────── Unsealing
//! ```
//!
//! Requests only start a transition. The transition completes in
//! [`reconcile`], which runs whenever a report for the log stream is
//! accepted, so the outcome is decided by replicated state alone.

use crate::error::{RepositoryError, Result};
use crate::metadata::LogStreamState;
use seqlog_protocol::{Llsn, LogStreamStatus, ReplicaStatus, Version};
use tracing::info;

/// Running or Unsealing → Sealing; Sealing and Sealed are left as they are
pub fn begin_seal(state: &mut LogStreamState) -> Result<()> {
    match state.status() {
        LogStreamStatus::Running | LogStreamStatus::Unsealing => {
            info!(
                log_stream = %state.descriptor.log_stream_id,
                from = %state.status(),
                "Sealing log stream"
            );
            state.descriptor.status = LogStreamStatus::Sealing;
            Ok(())
        }
        LogStreamStatus::Sealing | LogStreamStatus::Sealed => Ok(()),
        status @ LogStreamStatus::Deleted => Err(RepositoryError::InvalidStatusTransition {
            log_stream_id: state.descriptor.log_stream_id,
            status,
            operation: "seal",
        }),
    }
}

/// Sealing or Sealed → Unsealing; Running and Unsealing are left as they are
pub fn begin_unseal(state: &mut LogStreamState) -> Result<()> {
    match state.status() {
        LogStreamStatus::Sealing | LogStreamStatus::Sealed => {
            info!(
                log_stream = %state.descriptor.log_stream_id,
                from = %state.status(),
                "Unsealing log stream"
            );
            state.descriptor.status = LogStreamStatus::Unsealing;
            Ok(())
        }
        LogStreamStatus::Running | LogStreamStatus::Unsealing => Ok(()),
        status @ LogStreamStatus::Deleted => Err(RepositoryError::InvalidStatusTransition {
            log_stream_id: state.descriptor.log_stream_id,
            status,
            operation: "unseal",
        }),
    }
}

/// Complete a pending transition once every replica agrees
///
/// `committed_end` is one past the last committed LLSN and
/// `last_commit_version` the version that committed it. Returns the new
/// status if one was reached.
pub fn reconcile(
    state: &mut LogStreamState,
    committed_end: Llsn,
    last_commit_version: Version,
) -> Option<LogStreamStatus> {
    let next = match state.status() {
        LogStreamStatus::Sealing if all_sealed(state, committed_end, last_commit_version) => {
            LogStreamStatus::Sealed
        }
        LogStreamStatus::Unsealing if all_running(state) => LogStreamStatus::Running,
        _ => return None,
    };

    info!(
        log_stream = %state.descriptor.log_stream_id,
        from = %state.status(),
        to = %next,
        "Log stream status transition"
    );
    state.descriptor.status = next;
    Some(next)
}

fn all_sealed(state: &LogStreamState, committed_end: Llsn, last_commit_version: Version) -> bool {
    state.descriptor.replicas.iter().all(|replica| {
        state
            .reports
            .get(&replica.storage_node_id)
            .is_some_and(|r| {
                r.status == ReplicaStatus::Sealed
                    && r.uncommitted_llsn_offset == committed_end
                    && r.version >= last_commit_version
            })
    })
}

fn all_running(state: &LogStreamState) -> bool {
    state.descriptor.replicas.iter().all(|replica| {
        state
            .reports
            .get(&replica.storage_node_id)
            .is_some_and(|r| r.status == ReplicaStatus::Running)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqlog_protocol::{
        LogStreamDescriptor, LogStreamId, StorageNodeId, TopicId, UncommittedReport,
    };

    fn state() -> LogStreamState {
        LogStreamState::new(LogStreamDescriptor::new(
            TopicId(1),
            LogStreamId(1),
            [StorageNodeId(1), StorageNodeId(2)],
        ))
    }

    fn put(
        state: &mut LogStreamState,
        node: u32,
        version: u64,
        offset: u64,
        status: ReplicaStatus,
    ) {
        let report = UncommittedReport::new(StorageNodeId(node), LogStreamId(1))
            .with_version(Version(version), Default::default())
            .with_uncommitted(Llsn(offset), 0)
            .with_status(status);
        state.reports.insert(StorageNodeId(node), report);
    }

    #[test]
    fn test_seal_is_idempotent() {
        let mut state = state();
        begin_seal(&mut state).unwrap();
        assert_eq!(state.status(), LogStreamStatus::Sealing);
        begin_seal(&mut state).unwrap();
        assert_eq!(state.status(), LogStreamStatus::Sealing);

        state.descriptor.status = LogStreamStatus::Sealed;
        begin_seal(&mut state).unwrap();
        assert_eq!(state.status(), LogStreamStatus::Sealed);
    }

    #[test]
    fn test_sealed_requires_every_replica() {
        let mut state = state();
        begin_seal(&mut state).unwrap();

        put(&mut state, 1, 3, 10, ReplicaStatus::Sealed);
        assert_eq!(reconcile(&mut state, Llsn(10), Version(3)), None);

        // Second replica still has entries past the boundary
        put(&mut state, 2, 3, 12, ReplicaStatus::Sealed);
        assert_eq!(reconcile(&mut state, Llsn(10), Version(3)), None);

        // Truncated but behind on commits
        put(&mut state, 2, 2, 10, ReplicaStatus::Sealed);
        assert_eq!(reconcile(&mut state, Llsn(10), Version(3)), None);

        put(&mut state, 2, 3, 10, ReplicaStatus::Sealed);
        assert_eq!(
            reconcile(&mut state, Llsn(10), Version(3)),
            Some(LogStreamStatus::Sealed)
        );
    }

    #[test]
    fn test_unseal_waits_for_running_replicas() {
        let mut state = state();
        state.descriptor.status = LogStreamStatus::Sealed;
        put(&mut state, 1, 3, 10, ReplicaStatus::Sealed);
        put(&mut state, 2, 3, 10, ReplicaStatus::Sealed);

        begin_unseal(&mut state).unwrap();
        assert_eq!(state.status(), LogStreamStatus::Unsealing);
        assert_eq!(reconcile(&mut state, Llsn(10), Version(3)), None);

        put(&mut state, 1, 3, 10, ReplicaStatus::Running);
        put(&mut state, 2, 3, 10, ReplicaStatus::Running);
        assert_eq!(
            reconcile(&mut state, Llsn(10), Version(3)),
            Some(LogStreamStatus::Running)
        );

        // Unseal of a running log stream is a no-op
        begin_unseal(&mut state).unwrap();
        assert_eq!(state.status(), LogStreamStatus::Running);
    }
}
