//! Reflected message dispatch.
//!
//! Selects the task that handles a reflected message from its type tag alone.
//! Tags this device does not understand are skipped rather than rejected,
//! since newer devices of the same identity may reflect message types that
//! did not exist when this build was made.

use mdsync_types::{ConversationRef, MessageType};

/// Which reflected task handles a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflectedKind {
    /// Delete message contents.
    Delete,
    /// Delivery receipt or reaction.
    DeliveryReceipt,
    /// Create a poll.
    PollSetup,
    /// Vote on a poll.
    PollVote,
}

/// Conversation scope implied by the message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationScope {
    /// One-to-one conversation.
    Contact,
    /// Group conversation.
    Group,
}

impl ConversationScope {
    /// Check whether a decoded conversation reference matches this scope.
    pub fn matches(&self, conversation: &ConversationRef) -> bool {
        matches!(
            (self, conversation),
            (ConversationScope::Contact, ConversationRef::Contact { .. })
                | (ConversationScope::Group, ConversationRef::Group { .. })
        )
    }
}

/// Why a reflected message is not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The tag is not known to this device.
    UnknownType(u8),
    /// The type is known but never arrives as a reflection.
    NotReflected(MessageType),
}

/// Result of dispatching a reflected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handle the message with the given task kind.
    Handle {
        /// Task kind.
        kind: ReflectedKind,
        /// Scope the payload conversation must have.
        scope: ConversationScope,
    },
    /// Silently advance past the message.
    Skip(SkipReason),
}

/// Dispatch a reflected message type tag.
///
/// Pure function of the tag; performs no side effects.
pub fn dispatch(msg_type: u8) -> Dispatch {
    use ConversationScope::{Contact, Group};
    use ReflectedKind::*;

    let message_type = match MessageType::try_from(msg_type) {
        Ok(mt) => mt,
        Err(_) => return Dispatch::Skip(SkipReason::UnknownType(msg_type)),
    };

    let (kind, scope) = match message_type {
        MessageType::DeleteMessage => (Delete, Contact),
        MessageType::GroupDeleteMessage => (Delete, Group),
        MessageType::DeliveryReceipt => (DeliveryReceipt, Contact),
        MessageType::GroupDeliveryReceipt => (DeliveryReceipt, Group),
        MessageType::PollSetup => (PollSetup, Contact),
        MessageType::GroupPollSetup => (PollSetup, Group),
        MessageType::PollVote => (PollVote, Contact),
        MessageType::GroupPollVote => (PollVote, Group),
        MessageType::VoipCallAnswer => {
            return Dispatch::Skip(SkipReason::NotReflected(message_type))
        }
    };

    Dispatch::Handle { kind, scope }
}
