//! Encoding of entries proposed to the consensus log

use crate::error::{RepositoryError, Result};
use crate::metadata::MetadataCommand;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the proposal encoding
pub const PROPOSAL_VERSION: u16 = 1;

/// Who proposed an entry, so the applying replica can wake the caller
///
/// Leadership may move between proposal and commit; the tag travels with
/// the entry so any replica can tell whether it is the proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalTag {
    /// Client request waiting for the apply result
    Request {
        node_index: u64,
        /// Distinguishes restarts of the same node
        incarnation: Uuid,
        request_num: u64,
    },
    /// Proposed by a background task; nobody waits for it
    Background { node_index: u64 },
}

impl ProposalTag {
    pub fn node_index(&self) -> u64 {
        match self {
            ProposalTag::Request { node_index, .. } | ProposalTag::Background { node_index } => {
                *node_index
            }
        }
    }
}

/// Payload of one consensus log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub version: u16,
    pub tag: ProposalTag,
    pub command: MetadataCommand,
}

impl Proposal {
    pub fn new(tag: ProposalTag, command: MetadataCommand) -> Self {
        Self {
            version: PROPOSAL_VERSION,
            tag,
            command,
        }
    }
}

/// Encode a proposal for the consensus log
pub fn encode_proposal(proposal: &Proposal) -> Result<Bytes> {
    Ok(Bytes::from(seqlog_protocol::to_bytes(proposal)?))
}

/// Decode a committed log entry
pub fn decode_proposal(bytes: &[u8]) -> Result<Proposal> {
    let proposal: Proposal = seqlog_protocol::from_bytes(bytes)?;
    if proposal.version != PROPOSAL_VERSION {
        return Err(RepositoryError::Deserialization(format!(
            "unsupported proposal version {}",
            proposal.version
        )));
    }
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqlog_protocol::{TopicId, Version};

    #[test]
    fn test_proposal_encoding() {
        let proposal = Proposal::new(
            ProposalTag::Request {
                node_index: 2,
                incarnation: Uuid::new_v4(),
                request_num: 17,
            },
            MetadataCommand::RegisterTopic {
                topic_id: TopicId(3),
            },
        );
        let bytes = encode_proposal(&proposal).unwrap();
        let decoded = decode_proposal(&bytes).unwrap();
        assert_eq!(decoded, proposal);
        assert_eq!(decoded.tag.node_index(), 2);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut proposal = Proposal::new(
            ProposalTag::Background { node_index: 1 },
            MetadataCommand::Commit {
                base_version: Version(4),
            },
        );
        proposal.version = 99;
        let bytes = encode_proposal(&proposal).unwrap();
        assert!(matches!(
            decode_proposal(&bytes),
            Err(RepositoryError::Deserialization(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_proposal(&[0xff, 0xff, 0xff]).is_err());
    }
}
