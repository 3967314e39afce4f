//! Device linking state machine.
//!
//! A new device is linked through a rendezvous path between the existing
//! device and the new one. Both ends derive the same rendezvous path hash;
//! an interceptor in the middle would see two different paths. The operator
//! compares a short code derived from the hash on both screens and must
//! confirm the match before any provisioning material is exchanged.
//!
//! ```text
//! Connecting ──► Connected ──► Confirmed ──► Completed
//!     │              │
//!     │              └──► Declined ──► Failed
//!     └──────────────────────────────► Failed (transport error, cancellation)
//! ```
//!
//! This module is pure: `on_event` returns the next state and the actions the
//! caller must perform (resolve the confirmation signal, show the code).

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the rendezvous path hash in bytes.
pub const RPH_SIZE: usize = 32;

/// Hash of the established rendezvous path.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RendezvousPathHash([u8; RPH_SIZE]);

impl RendezvousPathHash {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; RPH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; RPH_SIZE] {
        &self.0
    }

    /// Derive the short code the operator compares on both devices.
    pub fn short_code(&self) -> ShortCode {
        ShortCode::from_hash_prefix([self.0[0], self.0[1], self.0[2]])
    }

    /// Hex encoding, used when reporting a declined path.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RendezvousPathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RendezvousPathHash({}..)", hex::encode(&self.0[..4]))
    }
}

/// Short authentication code: three indices into a 128 entry glyph table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortCode(pub u8, pub u8, pub u8);

impl ShortCode {
    /// Number of distinct values per index.
    pub const ALPHABET_SIZE: u8 = 128;

    /// Reduce the first three hash bytes modulo 128.
    pub fn from_hash_prefix(prefix: [u8; 3]) -> Self {
        Self(
            prefix[0] % Self::ALPHABET_SIZE,
            prefix[1] % Self::ALPHABET_SIZE,
            prefix[2] % Self::ALPHABET_SIZE,
        )
    }

    /// The three indices as an array.
    pub fn indices(&self) -> [u8; 3] {
        [self.0, self.1, self.2]
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.0, self.1, self.2)
    }
}

/// Why a linking session did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkingError {
    /// The operator reported that the short codes differ.
    #[error("rendezvous path declined by operator (rph={rph})")]
    Declined {
        /// Hex of the declined rendezvous path hash.
        rph: String,
    },
    /// The session was cancelled before it finished.
    #[error("linking cancelled: {0}")]
    Cancelled(String),
    /// The transport failed.
    #[error("linking transport error: {0}")]
    Transport(String),
    /// Waiting for a step took too long.
    #[error("linking timed out")]
    Timeout,
    /// Exchanging provisioning material failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
}

impl LinkingError {
    /// Whether this error is the operator declining the short code.
    pub fn is_declined(&self) -> bool {
        matches!(self, LinkingError::Declined { .. })
    }
}

/// Linking session state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkingState {
    /// Establishing the rendezvous path.
    Connecting,
    /// Rendezvous path established, waiting for the operator.
    Connected {
        /// Hash of the rendezvous path.
        rph: RendezvousPathHash,
        /// Code the operator compares.
        short_code: ShortCode,
    },
    /// Operator confirmed the code; provisioning may proceed.
    Confirmed,
    /// Operator declined the code.
    Declined,
    /// Terminal failure.
    Failed {
        /// What went wrong, if known.
        cause: Option<LinkingError>,
    },
    /// Terminal success: the new device is linked.
    Completed,
}

/// Inputs to the linking state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkingEvent {
    /// Both ends established the rendezvous path.
    RendezvousEstablished {
        /// Hash of the path.
        rph: RendezvousPathHash,
    },
    /// The operator confirmed the short code.
    OperatorConfirmed,
    /// The operator declined the short code.
    OperatorDeclined,
    /// Provisioning material was exchanged.
    ProvisioningCompleted,
    /// The session failed or was cancelled.
    Failed {
        /// Cause of the failure.
        cause: LinkingError,
    },
}

/// Actions for the caller to perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkingAction {
    /// Show the short code to the operator.
    ShowShortCode(ShortCode),
    /// Resolve the confirmation signal successfully.
    ResolveConfirmation,
    /// Resolve the confirmation signal with an error.
    RejectConfirmation(LinkingError),
}

impl LinkingState {
    /// Create a new session state in the Connecting state.
    pub fn new() -> Self {
        Self::Connecting
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// Events that do not apply to the current state leave it unchanged; in
    /// particular `ProvisioningCompleted` is only accepted after the operator
    /// confirmed, and terminal states never change.
    pub fn on_event(self, event: LinkingEvent) -> (Self, Vec<LinkingAction>) {
        match (self, event) {
            (Self::Connecting, LinkingEvent::RendezvousEstablished { rph }) => {
                let short_code = rph.short_code();
                (
                    Self::Connected { rph, short_code },
                    vec![LinkingAction::ShowShortCode(short_code)],
                )
            }

            (Self::Connected { .. }, LinkingEvent::OperatorConfirmed) => {
                (Self::Confirmed, vec![LinkingAction::ResolveConfirmation])
            }
            (Self::Connected { rph, .. }, LinkingEvent::OperatorDeclined) => {
                let error = LinkingError::Declined { rph: rph.to_hex() };
                (Self::Declined, vec![LinkingAction::RejectConfirmation(error)])
            }
            (Self::Connected { .. }, LinkingEvent::Failed { cause }) => (
                Self::Failed {
                    cause: Some(cause.clone()),
                },
                vec![LinkingAction::RejectConfirmation(cause)],
            ),

            (Self::Confirmed, LinkingEvent::ProvisioningCompleted) => (Self::Completed, vec![]),

            (Self::Connecting | Self::Confirmed | Self::Declined, LinkingEvent::Failed { cause }) => {
                (Self::Failed { cause: Some(cause) }, vec![])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// The short code, while waiting for the operator.
    pub fn short_code(&self) -> Option<ShortCode> {
        match self {
            Self::Connected { short_code, .. } => Some(*short_code),
            _ => None,
        }
    }

    /// Check if the session reached Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

impl Default for LinkingState {
    fn default() -> Self {
        Self::new()
    }
}
