//! # mdsync-types
//!
//! Wire format types for reflected multi-device messages.
//!
//! This crate provides the foundational types used across all mdsync crates:
//! - [`IdentityId`], [`MessageId`], [`GroupId`], [`Nonce`] - Identity and replay types
//! - [`ReflectedEnvelope`] - A reflected message with routing metadata
//! - [`DeleteMessage`], [`DeliveryReceipt`], [`PollSetup`], [`PollVote`],
//!   [`VoipCallAnswer`] - Typed reflected payloads
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{MessageType, OutgoingFrame, ReflectedEnvelope};
pub use error::WireError;
pub use ids::{GroupId, IdentityId, MessageId, Nonce, NONCE_SIZE};
pub use messages::{
    CallAnswerAction, ConversationRef, DeleteMessage, DeliveryReceipt, MessageFlags, PollChoice,
    PollSetup, PollVote, VoipCallAnswer, WirePayload, FLAG_BUMP_LAST_UPDATE,
    FLAG_PROTECT_AGAINST_REPLAY,
};
