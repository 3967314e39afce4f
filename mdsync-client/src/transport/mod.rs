//! Transport abstraction for the authenticated mediator connection.
//!
//! The connection itself (handshake, reconnection, framing) is owned by the
//! embedding application. The core only needs to:
//! - `recv()` reflected envelope bytes
//! - `send()` acknowledgements and outgoing messages
//! - learn why the connection closed via `close_reason()`

mod mock;

pub use mock::MockTransport;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the server closed the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    /// Close code as reported by the server
    pub code: u16,
    /// Human readable description
    pub reason: String,
}

impl CloseReason {
    /// Code for an orderly close.
    pub const NORMAL: u16 = 1000;
    /// Code for a connection lost without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Code sent when this device was dropped from the device group.
    pub const DEVICE_DROPPED: u16 = 4115;

    /// Create a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// An orderly close with no further detail.
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "normal closure")
    }

    /// Whether the server dropped this device from the group.
    pub fn is_device_dropped(&self) -> bool {
        self.code == Self::DEVICE_DROPPED
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Operation timed out.
    #[error("transport timeout")]
    Timeout,
}

/// Transport trait for the authenticated mediator connection.
///
/// Implementations must be safe to share between the reflection pump and
/// the task manager worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame over the connection.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next reflected envelope frame.
    ///
    /// Returns `ConnectionClosed` once the connection has gone away.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;

    /// Reason given by the server for the last close, if any.
    fn close_reason(&self) -> Option<CloseReason>;
}
