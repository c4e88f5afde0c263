//! Wire encoding errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode: {0}")]
    Serialization(String),

    #[error("failed to decode: {0}")]
    Deserialization(String),

    /// Encoded payload is larger than [`crate::MAX_MESSAGE_SIZE`]
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<postcard::Error> for ProtocolError {
    fn from(e: postcard::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
