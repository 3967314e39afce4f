//! ReflectedEnvelope - the wire format wrapper for reflected messages.

use serde::{Deserialize, Serialize};

use crate::{IdentityId, MessageId, Nonce, WireError, WirePayload};

/// End-to-end message type discriminator carried by a reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Poll setup in a contact conversation
    PollSetup = 0x15,
    /// Poll vote in a contact conversation
    PollVote = 0x16,
    /// Poll setup in a group conversation
    GroupPollSetup = 0x45,
    /// Poll vote in a group conversation
    GroupPollVote = 0x46,
    /// Answer to a call offer
    VoipCallAnswer = 0x61,
    /// Delivery receipt or reaction in a contact conversation
    DeliveryReceipt = 0x80,
    /// Delivery receipt or reaction in a group conversation
    GroupDeliveryReceipt = 0x81,
    /// Delete a message in a contact conversation
    DeleteMessage = 0x93,
    /// Delete a message in a group conversation
    GroupDeleteMessage = 0x94,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x15 => Ok(MessageType::PollSetup),
            0x16 => Ok(MessageType::PollVote),
            0x45 => Ok(MessageType::GroupPollSetup),
            0x46 => Ok(MessageType::GroupPollVote),
            0x61 => Ok(MessageType::VoipCallAnswer),
            0x80 => Ok(MessageType::DeliveryReceipt),
            0x81 => Ok(MessageType::GroupDeliveryReceipt),
            0x93 => Ok(MessageType::DeleteMessage),
            0x94 => Ok(MessageType::GroupDeleteMessage),
            _ => Err(WireError::InvalidMessageType(value)),
        }
    }
}

/// A message reflected to this device by another device of the same identity.
///
/// Immutable once received. The payload is the MessagePack-encoded typed
/// message; its shape depends on `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedEnvelope {
    /// Id of the reflected message
    pub message_id: MessageId,
    /// Identity that sent the original message (our own for outgoing reflections)
    pub sender_identity: IdentityId,
    /// Unix timestamp (milliseconds) when the message was created
    pub created_at: u64,
    /// Message type discriminator
    pub msg_type: u8,
    /// Replay-protection nonces used by the reflecting device
    pub nonces: Vec<Nonce>,
    /// MessagePack-encoded typed payload
    pub payload: Vec<u8>,
}

impl ReflectedEnvelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(
        msg_type: MessageType,
        message_id: MessageId,
        sender_identity: IdentityId,
        nonces: Vec<Nonce>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id,
            sender_identity,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            msg_type: msg_type as u8,
            nonces,
            payload,
        }
    }

    /// Create an envelope carrying an encoded typed payload and one fresh nonce.
    pub fn with_payload<P: WirePayload>(
        msg_type: MessageType,
        sender_identity: IdentityId,
        payload: &P,
    ) -> Result<Self, WireError> {
        Ok(Self::new(
            msg_type,
            MessageId::random(),
            sender_identity,
            vec![Nonce::random()],
            payload.to_bytes()?,
        ))
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Get the message type as an enum.
    pub fn message_type(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.msg_type)
    }
}

/// A frame this device sends on the authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingFrame {
    /// Acknowledge that a reflected message was processed.
    ///
    /// The mediator redelivers every reflection that was not acknowledged.
    ReflectedAck {
        /// Id of the processed reflection
        message_id: MessageId,
    },
    /// An end-to-end message for another identity.
    Message {
        /// Receiving identity
        recipient: IdentityId,
        /// Message type discriminator
        msg_type: u8,
        /// Id of the new message
        message_id: MessageId,
        /// MessagePack-encoded typed payload
        payload: Vec<u8>,
    },
}

impl OutgoingFrame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConversationRef, DeleteMessage};

    fn identity() -> IdentityId {
        IdentityId::new("ABCDEFGH").unwrap()
    }

    #[test]
    fn envelope_bytes_preserve_fields() {
        let envelope = ReflectedEnvelope {
            message_id: MessageId::from_u64(42),
            sender_identity: identity(),
            created_at: 1_705_000_000_000,
            msg_type: MessageType::DeleteMessage as u8,
            nonces: vec![Nonce::from_bytes([7u8; 24])],
            payload: vec![1, 2, 3, 4],
        };

        let bytes = envelope.to_bytes().unwrap();
        let restored = ReflectedEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(envelope, restored);
    }

    #[test]
    fn truncated_envelope_fails_to_decode() {
        let envelope = ReflectedEnvelope::new(
            MessageType::PollVote,
            MessageId::random(),
            identity(),
            vec![Nonce::random()],
            vec![0u8; 32],
        );
        let bytes = envelope.to_bytes().unwrap();

        let result = ReflectedEnvelope::from_bytes(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(WireError::Deserialization(_))));
    }

    #[test]
    fn message_type_values_match_discriminants() {
        for val in [0x15u8, 0x16, 0x45, 0x46, 0x61, 0x80, 0x81, 0x93, 0x94] {
            let mt = MessageType::try_from(val).unwrap();
            assert_eq!(mt as u8, val);
        }
    }

    #[test]
    fn unknown_message_type_fails() {
        assert!(MessageType::try_from(0x00).is_err());
        assert!(MessageType::try_from(0x01).is_err());
        assert!(MessageType::try_from(0xff).is_err());
    }

    #[test]
    fn with_payload_encodes_typed_message() {
        let delete = DeleteMessage::new(
            ConversationRef::Contact {
                identity: IdentityId::new("ZZZZZZZZ").unwrap(),
            },
            MessageId::from_u64(9),
        );
        let envelope =
            ReflectedEnvelope::with_payload(MessageType::DeleteMessage, identity(), &delete)
                .unwrap();

        assert_eq!(envelope.message_type().unwrap(), MessageType::DeleteMessage);
        assert_eq!(envelope.nonces.len(), 1);
        assert_eq!(DeleteMessage::from_bytes(&envelope.payload).unwrap(), delete);
    }

    #[test]
    fn new_sets_millisecond_timestamp() {
        let envelope = ReflectedEnvelope::new(
            MessageType::DeliveryReceipt,
            MessageId::random(),
            identity(),
            vec![],
            vec![],
        );
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert!(envelope.created_at <= now);
        assert!(envelope.created_at >= now - 60_000);
    }
}
