//! Network error types for framing and protocol operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while encoding or decoding a frame payload.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Failed to encode a packet
    #[error("Failed to encode packet: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Failed to decode a packet
    #[error("Failed to decode packet: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Frame size exceeded maximum allowed
    #[error("Frame size {actual} exceeds maximum {max}")]
    MessageTooLarge { actual: usize, max: usize },

    /// Invalid frame format
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),
}

impl From<SerializationError> for io::Error {
    fn from(error: SerializationError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

/// Result type for serialization operations
pub type Result<T> = std::result::Result<T, SerializationError>;
