//! Seqlog shared data model
//!
//! Types exchanged between the metadata repository and storage nodes:
//! identifiers, replica reports, commit results and registry descriptors.
//!
//! # Protocol Stability
//!
//! The enum variant order is significant for postcard serialization. Changes to variant
//! order will break compatibility with persisted snapshots and replicated log entries.

mod error;
mod metadata;
mod report;
mod types;

pub use error::{ProtocolError, Result};
pub use metadata::{
    ClusterInfo, LogStreamDescriptor, MetadataDescriptor, PeerInfo, ReplicaDescriptor,
    StorageNodeDescriptor, TopicDescriptor,
};
pub use report::{CommitResult, CommitRound, StorageNodeReport, UncommittedReport};
pub use types::{
    Glsn, Llsn, LogStreamId, LogStreamStatus, ReplicaStatus, StorageNodeId, StorageNodeStatus,
    TopicId, TopicStatus, Version,
};

use serde::{de::DeserializeOwned, Serialize};

/// Maximum encoded message size (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serialize a value (postcard format)
///
/// # Errors
///
/// Returns [`ProtocolError::MessageTooLarge`] if the encoding exceeds [`MAX_MESSAGE_SIZE`].
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(value)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Deserialize a value (postcard format)
pub fn from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_encoding() {
        let report = StorageNodeReport::new(
            StorageNodeId(1),
            vec![UncommittedReport::new(StorageNodeId(1), LogStreamId(2))
                .with_uncommitted(Llsn(1), 4)],
        );
        let bytes = to_bytes(&report).unwrap();
        let decoded: StorageNodeReport = from_bytes(&bytes).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let desc = StorageNodeDescriptor::new(StorageNodeId(9), "127.0.0.1:9000");
        let bytes = to_bytes(&desc).unwrap();
        let err = from_bytes::<StorageNodeDescriptor>(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
