//! Striped per-log-stream locks
//!
//! Seal, unseal and update of one log stream are serialized; different log
//! streams mostly proceed in parallel. A fixed array of mutexes indexed by
//! `log_stream_id mod N` bounds memory regardless of how many log streams
//! exist.

use seqlog_protocol::LogStreamId;
use tokio::sync::{Mutex, MutexGuard};

pub struct LogStreamLocks {
    stripes: Box<[Mutex<()>]>,
}

impl LogStreamLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_of(&self, id: LogStreamId) -> usize {
        id.get() as usize % self.stripes.len()
    }

    pub async fn lock(&self, id: LogStreamId) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(id)].lock().await
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
