//! # mdsync-core
//!
//! Pure logic for mdsync (no I/O, instant tests).
//!
//! This crate implements the decision logic of the multi-device core
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`dispatch`] maps a reflected message type to the task that handles it
//! - [`receipt`] maps receipt codes to message states
//! - [`linking`] is the device linking state machine
//! - [`retry`] computes retry decisions and backoff delays
//!
//! The actual I/O (network, storage, services) is performed by
//! `mdsync-client`, which interprets the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod linking;
pub mod receipt;
pub mod retry;

pub use dispatch::{dispatch, ConversationScope, Dispatch, ReflectedKind, SkipReason};
pub use linking::{
    LinkingAction, LinkingError, LinkingEvent, LinkingState, RendezvousPathHash, ShortCode,
};
pub use receipt::{reaction_for_receipt, MessageState, UnsupportedReceipt};
pub use retry::RetryPolicy;
