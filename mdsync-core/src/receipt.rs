//! Receipt type mapping.

use mdsync_types::DeliveryReceipt;

/// State of a message as recorded for a single identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Delivered to the recipient.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Acknowledged (thumbs up).
    UserAck,
    /// Declined (thumbs down).
    UserDecline,
}

impl MessageState {
    /// Map a receipt type code to a message state.
    pub fn from_receipt_type(code: u8) -> Option<Self> {
        match code {
            DeliveryReceipt::RECEIVED => Some(MessageState::Delivered),
            DeliveryReceipt::READ => Some(MessageState::Read),
            DeliveryReceipt::USER_ACK => Some(MessageState::UserAck),
            DeliveryReceipt::USER_DECLINE => Some(MessageState::UserDecline),
            _ => None,
        }
    }

    /// Whether this state is a reaction rather than a delivery status.
    pub fn is_reaction(&self) -> bool {
        matches!(self, MessageState::UserAck | MessageState::UserDecline)
    }
}

/// A receipt code that cannot be applied as a reflected reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedReceipt {
    /// The code is not known.
    #[error("unknown receipt type {0:#04x}")]
    Unknown(u8),
    /// The code is a delivery status, not a reaction.
    #[error("receipt type {0:?} is not a reaction")]
    NotReaction(MessageState),
}

/// Resolve the reaction a reflected outgoing receipt applies.
///
/// Our own devices only reflect reactions: delivery and read statuses are
/// about *received* messages and are never applied from a reflection.
pub fn reaction_for_receipt(code: u8) -> Result<MessageState, UnsupportedReceipt> {
    let state = MessageState::from_receipt_type(code).ok_or(UnsupportedReceipt::Unknown(code))?;
    if !state.is_reaction() {
        return Err(UnsupportedReceipt::NotReaction(state));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_codes() {
        assert_eq!(MessageState::from_receipt_type(0x01), Some(MessageState::Delivered));
        assert_eq!(MessageState::from_receipt_type(0x02), Some(MessageState::Read));
        assert_eq!(MessageState::from_receipt_type(0x03), Some(MessageState::UserAck));
        assert_eq!(MessageState::from_receipt_type(0x04), Some(MessageState::UserDecline));
        assert_eq!(MessageState::from_receipt_type(0x05), None);
    }

    #[test]
    fn only_ack_and_decline_are_reactions() {
        assert_eq!(reaction_for_receipt(0x03), Ok(MessageState::UserAck));
        assert_eq!(reaction_for_receipt(0x04), Ok(MessageState::UserDecline));
        assert_eq!(
            reaction_for_receipt(0x01),
            Err(UnsupportedReceipt::NotReaction(MessageState::Delivered))
        );
        assert_eq!(
            reaction_for_receipt(0x02),
            Err(UnsupportedReceipt::NotReaction(MessageState::Read))
        );
    }

    #[test]
    fn unknown_code_is_unsupported() {
        assert_eq!(reaction_for_receipt(0x7f), Err(UnsupportedReceipt::Unknown(0x7f)));
    }
}
