//! Correlation of proposed requests with their apply results
//!
//! A caller registers a waiter, proposes an entry tagged with the waiter's
//! number and awaits the result. The apply loop completes the waiter when
//! the tagged entry is applied on this replica. Entries proposed by other
//! replicas, or by an earlier run of this one, find no waiter and are only
//! applied.

use crate::error::{RepositoryError, Result};
use crate::metadata::MetadataResponse;
use crate::protocol::ProposalTag;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

type Waiter = oneshot::Sender<Result<MetadataResponse>>;

/// Pending requests of this replica
pub struct RequestMap {
    node_index: u64,
    incarnation: Uuid,
    next_request: AtomicU64,
    waiters: DashMap<u64, Waiter>,
}

impl RequestMap {
    pub fn new(node_index: u64) -> Arc<Self> {
        Arc::new(Self {
            node_index,
            incarnation: Uuid::new_v4(),
            next_request: AtomicU64::new(1),
            waiters: DashMap::new(),
        })
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    /// Register a waiter; dropping the returned guard unregisters it
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let request_num = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_num, tx);
        PendingRequest {
            map: Arc::clone(self),
            request_num,
            rx: Some(rx),
        }
    }

    /// Tag for proposals made by background tasks
    pub fn background_tag(&self) -> ProposalTag {
        ProposalTag::Background {
            node_index: self.node_index,
        }
    }

    /// Deliver an apply result; returns whether a local waiter was woken
    pub fn complete(&self, tag: &ProposalTag, result: Result<MetadataResponse>) -> bool {
        let ProposalTag::Request {
            node_index,
            incarnation,
            request_num,
        } = *tag
        else {
            return false;
        };
        if node_index != self.node_index || incarnation != self.incarnation {
            return false;
        }

        match self.waiters.remove(&request_num) {
            Some((_, waiter)) => {
                // Receiver gone means the caller already gave up
                let _ = waiter.send(result);
                true
            }
            None => {
                trace!(request_num, "No waiter for applied request");
                false
            }
        }
    }

    /// Fail every pending request (shutdown)
    pub fn fail_all(&self, err: impl Fn() -> RepositoryError) {
        let keys: Vec<u64> = self.waiters.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, waiter)) = self.waiters.remove(&key) {
                let _ = waiter.send(Err(err()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Registered waiter for one request
pub struct PendingRequest {
    map: Arc<RequestMap>,
    request_num: u64,
    rx: Option<oneshot::Receiver<Result<MetadataResponse>>>,
}

impl PendingRequest {
    /// Tag to attach to the proposal
    pub fn tag(&self) -> ProposalTag {
        ProposalTag::Request {
            node_index: self.map.node_index,
            incarnation: self.map.incarnation,
            request_num: self.request_num,
        }
    }

    /// Wait for the apply result, at most `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<MetadataResponse> {
        let rx = self.rx.take().ok_or(RepositoryError::ChannelClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RepositoryError::ChannelClosed),
            Err(_) => Err(RepositoryError::DeadlineExceeded),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.map.waiters.remove(&self.request_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let map = RequestMap::new(1);
        let pending = map.register();
        let tag = pending.tag();

        assert!(map.complete(&tag, Ok(MetadataResponse::Success)));
        let result = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, MetadataResponse::Success);
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let map = RequestMap::new(1);
        let pending = map.register();
        let tag = pending.tag();
        assert_eq!(map.len(), 1);

        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DeadlineExceeded));
        assert!(map.is_empty());

        // Late apply finds nobody to wake
        assert!(!map.complete(&tag, Ok(MetadataResponse::Success)));
    }

    #[test]
    fn test_cancelled_request_is_removed() {
        let map = RequestMap::new(1);
        let pending = map.register();
        drop(pending);
        assert!(map.is_empty());
    }

    #[test]
    fn test_foreign_tags_are_ignored() {
        let map = RequestMap::new(1);
        let pending = map.register();
        let ProposalTag::Request { request_num, .. } = pending.tag() else {
            panic!("expected request tag");
        };

        let other_node = ProposalTag::Request {
            node_index: 2,
            incarnation: map.incarnation(),
            request_num,
        };
        let previous_run = ProposalTag::Request {
            node_index: 1,
            incarnation: Uuid::new_v4(),
            request_num,
        };
        assert!(!map.complete(&other_node, Ok(MetadataResponse::Success)));
        assert!(!map.complete(&previous_run, Ok(MetadataResponse::Success)));
        assert!(!map.complete(&map.background_tag(), Ok(MetadataResponse::Success)));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let map = RequestMap::new(1);
        let pending = map.register();
        map.fail_all(|| RepositoryError::ShuttingDown);
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ShuttingDown));
    }
}
