//! Error types for the mdsync wire format.

use thiserror::Error;

/// Errors that can occur while encoding or decoding reflected messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid message type discriminator
    #[error("invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    /// Identity string is not a valid 8 character identity
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
