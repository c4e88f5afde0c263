//! End-to-end sequencing tests against in-process storage nodes
//!
//! - Written entries get committed once every replica has them
//! - GLSNs are unique and gapless across the log streams of a topic
//! - Registration is idempotent; conflicting registrations are rejected
//! - Unreachable storage nodes stay registered and are reported stale

mod common;

use common::*;
use seqlog_metarepos::{MemoryCluster, MetadataRepository, RepositoryError};
use seqlog_protocol::{
    Glsn, Llsn, LogStreamDescriptor, LogStreamId, StorageNodeDescriptor, StorageNodeId, TopicId,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn start(
    replication_factor: usize,
    nodes: &Arc<MockStorageNodes>,
) -> Arc<MetadataRepository> {
    init_tracing();
    let cluster = MemoryCluster::standalone();
    MetadataRepository::start(
        test_config(1, replication_factor),
        Arc::new(cluster.node(1)),
        nodes.clone(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_commits_entries_held_by_every_replica() {
    let nodes = MockStorageNodes::new();
    let sn = &[nodes.add(1), nodes.add(2)];
    let repo = &start(2, &nodes).await;
    setup_log_stream(repo, sn, 1, 1).await;
    let ls = LogStreamId(1);

    sn[0].append(ls, 5);
    sn[1].append(ls, 5);

    assert!(eventually(WAIT, || async move { committed_end(repo, 1).await == Llsn(6) }).await);
    assert!(
        eventually(WAIT, || async move {
            sn[0].committed_end(ls) == Llsn(6) && sn[1].committed_end(ls) == Llsn(6)
        })
        .await
    );

    let last = repo.get_last_commit_results().await.unwrap().unwrap();
    assert_eq!(last.high_watermark(TopicId(1)), Some(Glsn(5)));

    let applied = sn[0].applied(ls);
    assert_eq!(applied.first().unwrap().committed_glsn_offset, Glsn(1));
    assert_eq!(applied.last().unwrap().committed_glsn_end(), Glsn(6));

    repo.shutdown().await;
}

#[tokio::test]
async fn test_no_commit_without_every_replica() {
    let nodes = MockStorageNodes::new();
    let sn = &[nodes.add(1), nodes.add(2)];
    let repo = &start(2, &nodes).await;
    setup_log_stream(repo, sn, 1, 1).await;
    let ls = LogStreamId(1);

    sn[0].append(ls, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(committed_end(repo, 1).await, Llsn::MIN);

    // The lagging replica decides how much commits
    sn[1].append(ls, 2);
    assert!(eventually(WAIT, || async move { committed_end(repo, 1).await == Llsn(3) }).await);

    sn[1].append(ls, 2);
    assert!(eventually(WAIT, || async move { committed_end(repo, 1).await == Llsn(5) }).await);

    repo.shutdown().await;
}

#[tokio::test]
async fn test_glsns_are_unique_and_gapless_within_topic() {
    let nodes = MockStorageNodes::new();
    let sn = &[nodes.add(1), nodes.add(2)];
    let repo = &start(1, &nodes).await;

    for node in sn {
        repo.register_storage_node(node.descriptor()).await.unwrap();
    }
    repo.register_topic(TopicId(1)).await.unwrap();
    for (i, node) in sn.iter().enumerate() {
        let ls = LogStreamId(i as u32 + 1);
        node.add_replica(ls);
        repo.register_log_stream(LogStreamDescriptor::new(TopicId(1), ls, [node.id()]))
            .await
            .unwrap();
    }

    for batch in 1..=10u64 {
        sn[0].append(LogStreamId(1), batch);
        sn[1].append(LogStreamId(2), 11 - batch);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    let total: u64 = (1..=10u64).sum::<u64>() * 2;
    assert!(
        eventually(WAIT, || async move {
            committed_end(repo, 1).await == Llsn(56) && committed_end(repo, 2).await == Llsn(56)
        })
        .await
    );

    let mut results = history(repo).await;
    assert_eq!(results.iter().map(|r| r.committed_glsn_length).sum::<u64>(), total);

    // Dense GLSNs across the topic
    results.sort_by_key(|r| r.committed_glsn_offset);
    let mut next = Glsn::MIN;
    for r in &results {
        assert_eq!(r.committed_glsn_offset, next);
        next = r.committed_glsn_end();
    }

    // Dense LLSNs within each log stream
    for ls in [LogStreamId(1), LogStreamId(2)] {
        let mut next = Llsn::MIN;
        for r in results.iter().filter(|r| r.log_stream_id == ls) {
            assert_eq!(r.committed_llsn_offset, next);
            next = r.committed_llsn_end();
        }
        assert_eq!(next, Llsn(56));
    }

    repo.shutdown().await;
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let nodes = MockStorageNodes::new();
    let sn = nodes.add(1);
    let repo = &start(1, &nodes).await;

    repo.register_storage_node(sn.descriptor()).await.unwrap();
    repo.register_storage_node(sn.descriptor()).await.unwrap();
    let err = repo
        .register_storage_node(StorageNodeDescriptor::new(sn.id(), "elsewhere:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::StorageNodeAlreadyExists(_)));

    repo.register_topic(TopicId(1)).await.unwrap();
    repo.register_topic(TopicId(1)).await.unwrap();

    let desc = LogStreamDescriptor::new(TopicId(1), LogStreamId(1), [sn.id()]);
    let first = repo.register_log_stream(desc.clone()).await.unwrap();
    let again = repo.register_log_stream(desc).await.unwrap();
    assert_eq!(first, again);

    let metadata = repo.get_metadata().await.unwrap();
    assert_eq!(metadata.storage_nodes.len(), 1);
    assert_eq!(metadata.topics.len(), 1);
    assert_eq!(metadata.log_streams.len(), 1);

    repo.shutdown().await;
}

#[tokio::test]
async fn test_registry_validation() {
    let nodes = MockStorageNodes::new();
    let sn = &[nodes.add(1), nodes.add(2)];
    let repo = &start(2, &nodes).await;
    setup_log_stream(repo, sn, 1, 1).await;

    // Wrong replica count
    let err = repo
        .register_log_stream(LogStreamDescriptor::new(TopicId(1), LogStreamId(2), [sn[0].id()]))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidReplicas { .. }));

    // Unknown storage node
    let err = repo
        .register_log_stream(LogStreamDescriptor::new(
            TopicId(1),
            LogStreamId(2),
            [sn[0].id(), StorageNodeId(9)],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::StorageNodeNotFound(StorageNodeId(9))));

    // Storage node still hosts a replica
    let err = repo.unregister_storage_node(sn[0].id()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::StorageNodeInUse { .. }));

    // Running log streams keep their replicas
    let swapped = LogStreamDescriptor::new(TopicId(1), LogStreamId(1), [sn[1].id(), sn[0].id()]);
    let err = repo.update_log_stream(swapped).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidStatusTransition { .. }));

    repo.unregister_log_stream(LogStreamId(1)).await.unwrap();
    repo.unregister_storage_node(sn[0].id()).await.unwrap();
    let metadata = repo.get_metadata().await.unwrap();
    assert!(metadata.log_stream(LogStreamId(1)).is_none());
    assert!(metadata.storage_node(sn[0].id()).is_none());
    assert!(metadata.topic(TopicId(1)).unwrap().log_streams.is_empty());

    repo.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_storage_node_stays_registered() {
    let nodes = MockStorageNodes::new();
    let sn = &[nodes.add(1), nodes.add(2)];
    let repo = &start(2, &nodes).await;
    setup_log_stream(repo, sn, 1, 1).await;
    let ls = LogStreamId(1);

    sn[1].set_down(true);
    sn[0].append(ls, 3);
    sn[1].append(ls, 3);

    assert!(
        eventually(WAIT, || async move {
            repo.collector()
                .stale_nodes()
                .iter()
                .any(|d| d.storage_node_id == sn[1].id())
        })
        .await
    );
    assert_eq!(committed_end(repo, 1).await, Llsn::MIN);
    assert!(repo.get_metadata().await.unwrap().storage_node(sn[1].id()).is_some());
    assert_eq!(repo.collector().num_executors(), 2);

    // Back online: commits resume and the replica catches up
    sn[1].set_down(false);
    assert!(eventually(WAIT, || async move { sn[1].committed_end(ls) == Llsn(4) }).await);
    assert!(repo.collector().stale_nodes().is_empty());

    repo.shutdown().await;
}
