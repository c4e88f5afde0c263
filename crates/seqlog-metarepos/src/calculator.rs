//! Commit calculation
//!
//! Pure functions that turn the latest replica reports into the next
//! commit round. Nothing here fails: a log stream that cannot be decided
//! this round simply commits zero entries.
//!
//! For one log stream the calculation is:
//!
//! 1. Skip unless the log stream is Running and every non-learner replica
//!    has reported.
//! 2. The committable range is the intersection of the replicas'
//!    uncommitted ranges: `[max(offset), min(end))`.
//! 3. Replicas report relative to the latest version they applied. If that
//!    is older than the store's latest version, the part of the range below
//!    the log stream's committed end was already committed and is cut off.
//!
//! Only the latest reports and the per log stream committed end are read,
//! so the outcome does not depend on how much history a replica retains.
//!
//! GLSNs are assigned per topic in ascending `TopicId`, then ascending
//! `LogStreamId` order, continuing right after the topic's high watermark.

use crate::metadata::{ClusterMetadata, LogStreamState};
use seqlog_protocol::{
    CommitResult, CommitRound, Glsn, Llsn, LogStreamId, LogStreamStatus, ReplicaDescriptor,
    StorageNodeId, TopicId, UncommittedReport, Version,
};
use std::collections::BTreeMap;
use tracing::{error, warn};

/// Outcome of [`calculate_commit`] for one log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitDecision {
    /// Highest version any replica has applied
    pub known_version: Version,
    /// High watermark reported together with `known_version`
    pub known_high_watermark: Glsn,
    /// Lowest version any replica has applied
    pub min_version: Version,
    /// Highest uncommitted offset reported
    pub uncommitted_llsn_offset: Llsn,
    /// Lowest uncommitted end reported
    pub uncommitted_llsn_end: Llsn,
    /// Entries present on every replica, before cutting off earlier commits
    pub nr_commit: u64,
}

/// Decide how many entries every replica of a log stream holds uncommitted
///
/// Returns `None` when the log stream must not commit this round. Ties on
/// version are broken by ascending `StorageNodeId`.
pub fn calculate_commit(
    status: LogStreamStatus,
    replicas: &[ReplicaDescriptor],
    reports: &BTreeMap<StorageNodeId, UncommittedReport>,
) -> Option<CommitDecision> {
    if !status.is_running() {
        return None;
    }

    let mut voters = replicas.iter().filter(|r| !r.learner).peekable();
    voters.peek()?;

    let mut begin = Llsn::INVALID;
    let mut end: Option<Llsn> = None;
    let mut known: Option<&UncommittedReport> = None;
    let mut min: Option<&UncommittedReport> = None;

    // Reports are visited in storage node order, so strict comparisons keep
    // the lowest id on ties.
    let mut ordered: Vec<&UncommittedReport> = Vec::new();
    for replica in voters {
        ordered.push(reports.get(&replica.storage_node_id)?);
    }
    ordered.sort_by_key(|r| r.storage_node_id);

    for report in ordered {
        begin = begin.max(report.uncommitted_llsn_offset);
        let report_end = report.uncommitted_llsn_end();
        end = Some(end.map_or(report_end, |e| e.min(report_end)));

        if known.map_or(true, |k| report.version > k.version) {
            known = Some(report);
        }
        if min.map_or(true, |m| report.version < m.version) {
            min = Some(report);
        }
    }

    let (end, known, min) = (end?, known?, min?);
    let nr_commit = if begin > end {
        0
    } else {
        end.get() - begin.get()
    };

    Some(CommitDecision {
        known_version: known.version,
        known_high_watermark: known.high_watermark,
        min_version: min.version,
        uncommitted_llsn_offset: begin,
        uncommitted_llsn_end: end,
        nr_commit,
    })
}

/// Entries of a log stream committed after `known_version`
///
/// Diffs the round right after `known_version` against the latest round.
/// Returns `None` when that round is no longer retained. Consumers use this
/// to learn their progress; commit decisions never depend on it.
pub fn num_committed_since(
    metadata: &ClusterMetadata,
    topic_id: TopicId,
    log_stream_id: LogStreamId,
    known_version: Version,
) -> Option<u64> {
    let latest = metadata.last_commit_results()?;
    if known_version >= latest.version {
        return Some(0);
    }
    let Some(latest_result) = latest.find(topic_id, log_stream_id) else {
        return Some(0);
    };

    let base = metadata.lookup_next_commit_results(known_version)?;
    if base.version != known_version.next() {
        return None;
    }
    // Absent from the base round: registered later, committed from the start
    let start = base
        .find(topic_id, log_stream_id)
        .map(|r| r.committed_llsn_offset)
        .unwrap_or(Llsn::MIN);

    Some(
        latest_result
            .committed_llsn_end()
            .get()
            .saturating_sub(start.get()),
    )
}

/// Build the round following the store's latest version
///
/// Every registered log stream gets a result, zero-length when it commits
/// nothing. Returns `None` when no log stream commits anything.
pub fn build_commit_round(metadata: &ClusterMetadata) -> Option<CommitRound> {
    let last_version = metadata.last_version();
    let version = last_version.next();

    let mut results = Vec::with_capacity(metadata.log_streams.len());
    let mut total = 0u64;

    for (topic_id, topic) in &metadata.topics {
        let first = results.len();
        let mut next_glsn = topic.high_watermark.advance(1);

        for ls_id in &topic.descriptor.log_streams {
            let Some(state) = metadata.log_streams.get(ls_id) else {
                continue;
            };
            let nr_commit =
                calculate_commit(state.status(), &state.descriptor.replicas, &state.reports)
                    .map_or(0, |decision| committable(state, decision, last_version));

            results.push(CommitResult {
                topic_id: *topic_id,
                log_stream_id: *ls_id,
                committed_llsn_offset: state.committed_end,
                committed_glsn_offset: next_glsn,
                committed_glsn_length: nr_commit,
                version,
                high_watermark: Glsn::INVALID,
            });
            next_glsn = next_glsn.advance(nr_commit);
            total += nr_commit;
        }

        let high_watermark = next_glsn.saturating_sub(1);
        for result in &mut results[first..] {
            result.high_watermark = high_watermark;
        }
    }

    if total == 0 {
        return None;
    }
    Some(CommitRound::new(version, results))
}

fn committable(state: &LogStreamState, decision: CommitDecision, last_version: Version) -> u64 {
    if decision.nr_commit == 0 {
        return 0;
    }
    let log_stream_id = state.descriptor.log_stream_id;
    if decision.known_version > last_version {
        warn!(
            log_stream = %log_stream_id,
            known_version = %decision.known_version,
            last_version = %last_version,
            "Replica version ahead of commit history"
        );
        return 0;
    }
    if decision.uncommitted_llsn_offset > state.committed_end {
        error!(
            log_stream = %log_stream_id,
            uncommitted_offset = %decision.uncommitted_llsn_offset,
            committed_end = %state.committed_end,
            "Reports ahead of committed end"
        );
        return 0;
    }

    decision
        .uncommitted_llsn_end
        .get()
        .saturating_sub(state.committed_end.get())
}
