//! Error types for wire decoding

use thiserror::Error;

/// A packet that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet shorter than its fixed header
    #[error("truncated packet: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    /// Payload failed to decode
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Encoded message exceeds the maximum datagram size
    #[error("message of {0} bytes exceeds the maximum message length")]
    Oversize(usize),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
