//! Typed payloads carried inside a [`ReflectedEnvelope`](crate::ReflectedEnvelope).
//!
//! Every payload carries a `flags` byte. The replay and recency policy of a
//! message is read from these flags, so a newer device can change the policy
//! of a message without this device needing to understand why.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{GroupId, IdentityId, MessageId, WireError};

/// The receiving device must record the message nonces and reject replays.
pub const FLAG_PROTECT_AGAINST_REPLAY: u8 = 0x01;

/// Processing the message moves its conversation to the top of the list.
pub const FLAG_BUMP_LAST_UPDATE: u8 = 0x02;

/// MessagePack encoding shared by all typed payloads.
pub trait WirePayload: Serialize + DeserializeOwned {
    /// Serialize to MessagePack bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

/// Access to the policy bits of a payload.
pub trait MessageFlags {
    /// Raw flags byte.
    fn flags(&self) -> u8;

    /// Whether the nonces of this message must be stored.
    fn protect_against_replay(&self) -> bool {
        self.flags() & FLAG_PROTECT_AGAINST_REPLAY != 0
    }

    /// Whether processing this message bumps the conversation.
    fn bump_last_update(&self) -> bool {
        self.flags() & FLAG_BUMP_LAST_UPDATE != 0
    }
}

/// The conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationRef {
    /// One-to-one conversation with a contact.
    Contact {
        /// The contact's identity.
        identity: IdentityId,
    },
    /// Group conversation, addressed by creator and group id.
    Group {
        /// Identity that created the group.
        creator: IdentityId,
        /// Group id, unique per creator.
        group_id: GroupId,
    },
}

impl std::fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationRef::Contact { identity } => write!(f, "contact:{}", identity),
            ConversationRef::Group { creator, group_id } => {
                write!(f, "group:{}/{}", creator, group_id)
            }
        }
    }
}

/// Delete the contents of an earlier message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    /// Conversation containing the target
    pub conversation: ConversationRef,
    /// The message to delete
    pub target_message_id: MessageId,
    /// Policy flags
    pub flags: u8,
}

impl DeleteMessage {
    /// Create a delete message with default flags (replay protected).
    pub fn new(conversation: ConversationRef, target_message_id: MessageId) -> Self {
        Self {
            conversation,
            target_message_id,
            flags: FLAG_PROTECT_AGAINST_REPLAY,
        }
    }
}

/// Delivery receipt, read receipt or reaction for one or more messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Conversation containing the referenced messages
    pub conversation: ConversationRef,
    /// Receipt type code (see the associated constants)
    pub receipt_type: u8,
    /// Messages the receipt applies to
    pub message_ids: Vec<MessageId>,
    /// Policy flags
    pub flags: u8,
}

impl DeliveryReceipt {
    /// Message was received.
    pub const RECEIVED: u8 = 0x01;
    /// Message was read.
    pub const READ: u8 = 0x02;
    /// Message was acknowledged (thumbs up).
    pub const USER_ACK: u8 = 0x03;
    /// Message was declined (thumbs down).
    pub const USER_DECLINE: u8 = 0x04;

    /// Create a receipt with default flags (replay protected, no bump).
    pub fn new(conversation: ConversationRef, receipt_type: u8, message_ids: Vec<MessageId>) -> Self {
        Self {
            conversation,
            receipt_type,
            message_ids,
            flags: FLAG_PROTECT_AGAINST_REPLAY,
        }
    }
}

/// One answer option of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollChoice {
    /// Choice id, unique within the poll
    pub id: u32,
    /// Display text
    pub text: String,
}

/// Create a poll.
///
/// The creator is not part of the payload; it is the sender of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSetup {
    /// Conversation the poll is posted to
    pub conversation: ConversationRef,
    /// Poll id, unique per creator
    pub poll_id: u64,
    /// Poll question
    pub description: String,
    /// Answer options
    pub choices: Vec<PollChoice>,
    /// Whether more than one choice may be selected
    pub multiple_choice: bool,
    /// Policy flags
    pub flags: u8,
}

impl PollSetup {
    /// Create a poll setup with default flags (replay protected, bumps).
    pub fn new(
        conversation: ConversationRef,
        poll_id: u64,
        description: impl Into<String>,
        choices: Vec<PollChoice>,
    ) -> Self {
        Self {
            conversation,
            poll_id,
            description: description.into(),
            choices,
            multiple_choice: false,
            flags: FLAG_PROTECT_AGAINST_REPLAY | FLAG_BUMP_LAST_UPDATE,
        }
    }
}

/// Vote on an existing poll.
///
/// The voter is not part of the payload; it is the sender of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollVote {
    /// Conversation the poll lives in
    pub conversation: ConversationRef,
    /// Identity that created the poll
    pub poll_creator: IdentityId,
    /// Poll id, unique per creator
    pub poll_id: u64,
    /// Selected choice ids
    pub choice_ids: Vec<u32>,
    /// Policy flags
    pub flags: u8,
}

impl PollVote {
    /// Create a vote with default flags (replay protected, no bump).
    pub fn new(
        conversation: ConversationRef,
        poll_creator: IdentityId,
        poll_id: u64,
        choice_ids: Vec<u32>,
    ) -> Self {
        Self {
            conversation,
            poll_creator,
            poll_id,
            choice_ids,
            flags: FLAG_PROTECT_AGAINST_REPLAY,
        }
    }
}

/// How a call offer was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallAnswerAction {
    /// The call was accepted.
    Accept,
    /// The call was rejected.
    Reject {
        /// Reject reason code.
        reason: u8,
    },
}

/// Answer to a call offer. Real-time signaling, never reflected back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoipCallAnswer {
    /// Call the answer belongs to
    pub call_id: u32,
    /// Accept or reject
    pub action: CallAnswerAction,
    /// Policy flags
    pub flags: u8,
}

impl VoipCallAnswer {
    /// Create a call answer. Signaling messages carry no policy flags.
    pub fn new(call_id: u32, action: CallAnswerAction) -> Self {
        Self {
            call_id,
            action,
            flags: 0,
        }
    }
}

macro_rules! impl_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WirePayload for $ty {}

            impl MessageFlags for $ty {
                fn flags(&self) -> u8 {
                    self.flags
                }
            }
        )*
    };
}

impl_payload!(DeleteMessage, DeliveryReceipt, PollSetup, PollVote, VoipCallAnswer);

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ConversationRef {
        ConversationRef::Contact {
            identity: IdentityId::new("ECHOECHO").unwrap(),
        }
    }

    fn group() -> ConversationRef {
        ConversationRef::Group {
            creator: IdentityId::new("GROUPCRT").unwrap(),
            group_id: GroupId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
        }
    }

    #[test]
    fn default_flags_per_type() {
        let delete = DeleteMessage::new(contact(), MessageId::random());
        assert!(delete.protect_against_replay());
        assert!(!delete.bump_last_update());

        let receipt = DeliveryReceipt::new(group(), DeliveryReceipt::USER_ACK, vec![]);
        assert!(receipt.protect_against_replay());
        assert!(!receipt.bump_last_update());

        let setup = PollSetup::new(group(), 1, "Lunch?", vec![]);
        assert!(setup.protect_against_replay());
        assert!(setup.bump_last_update());

        let vote = PollVote::new(group(), IdentityId::new("GROUPCRT").unwrap(), 1, vec![0]);
        assert!(vote.protect_against_replay());
        assert!(!vote.bump_last_update());

        let answer = VoipCallAnswer::new(7, CallAnswerAction::Accept);
        assert!(!answer.protect_against_replay());
        assert!(!answer.bump_last_update());
    }

    #[test]
    fn flags_are_read_from_payload() {
        let mut delete = DeleteMessage::new(contact(), MessageId::random());
        delete.flags = FLAG_BUMP_LAST_UPDATE;
        assert!(!delete.protect_against_replay());
        assert!(delete.bump_last_update());
    }

    #[test]
    fn poll_setup_survives_encoding() {
        let setup = PollSetup::new(
            group(),
            0xDEAD_BEEF,
            "Where do we meet?",
            vec![
                PollChoice {
                    id: 0,
                    text: "Here".into(),
                },
                PollChoice {
                    id: 1,
                    text: "There".into(),
                },
            ],
        );

        let bytes = setup.to_bytes().unwrap();
        let restored = PollSetup::from_bytes(&bytes).unwrap();
        assert_eq!(setup, restored);
    }

    #[test]
    fn decoding_wrong_payload_type_fails() {
        let answer = VoipCallAnswer::new(3, CallAnswerAction::Reject { reason: 2 });
        let bytes = answer.to_bytes().unwrap();

        assert!(PollVote::from_bytes(&bytes).is_err());
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result = DeliveryReceipt::from_bytes(&[0xc1, 0x00, 0x13]);
        assert!(matches!(result, Err(WireError::Deserialization(_))));
    }

    #[test]
    fn conversation_display() {
        assert_eq!(contact().to_string(), "contact:ECHOECHO");
        assert_eq!(group().to_string(), "group:GROUPCRT/0102030405060708");
    }
}
