//! Identity, message and replay-protection identifiers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Size of a replay-protection nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// The identity shared by all devices of one user.
///
/// Exactly 8 characters from `A-Z`, `0-9` or `*` (gateway identities).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    /// Length of every identity string.
    pub const LEN: usize = 8;

    /// Parse and validate an identity string.
    pub fn new(identity: &str) -> Result<Self, WireError> {
        let valid = identity.len() == Self::LEN
            && identity
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '*');
        if valid {
            Ok(Self(identity.to_string()))
        } else {
            Err(WireError::InvalidIdentity(identity.to_string()))
        }
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityId {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<IdentityId> for String {
    fn from(id: IdentityId) -> Self {
        id.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", self.0)
    }
}

/// An 8-byte message identifier, unique per sender.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 8]);

impl MessageId {
    /// Create a new random MessageId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a MessageId from raw bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create a MessageId from its little-endian integer form.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_le_bytes())
    }

    /// Get the raw bytes of this MessageId.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// An 8-byte group identifier, unique per group creator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId([u8; 8]);

impl GroupId {
    /// Create a new random GroupId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a GroupId from raw bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this GroupId.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self)
    }
}

/// A single-use replay-protection token accompanying a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random Nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a Nonce from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; NONCE_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Create a Nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this Nonce.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", &self.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_accepts_valid_ids() {
        assert!(IdentityId::new("ECHOECHO").is_ok());
        assert!(IdentityId::new("0123ABCD").is_ok());
        assert!(IdentityId::new("*THREEMA").is_ok());
    }

    #[test]
    fn identity_rejects_invalid_ids() {
        assert!(IdentityId::new("SHORT").is_err());
        assert!(IdentityId::new("TOOLONGID").is_err());
        assert!(IdentityId::new("lowercas").is_err());
        assert!(IdentityId::new("ABC-DEFG").is_err());
    }

    #[test]
    fn identity_serde_validates() {
        let ok: IdentityId = serde_json::from_str("\"ABCDEFGH\"").unwrap();
        assert_eq!(ok.as_str(), "ABCDEFGH");

        let bad: Result<IdentityId, _> = serde_json::from_str("\"abc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn message_id_hex_display() {
        let id = MessageId::from_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xff]);
        assert_eq!(id.to_string(), "01020304050607ff");
    }

    #[test]
    fn message_id_from_u64_is_little_endian() {
        let id = MessageId::from_u64(1);
        assert_eq!(id.as_bytes(), &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn random_message_ids_differ() {
        assert_ne!(MessageId::random(), MessageId::random());
    }

    #[test]
    fn nonce_from_slice_checks_length() {
        assert!(Nonce::from_slice(&[0u8; NONCE_SIZE]).is_some());
        assert!(Nonce::from_slice(&[0u8; 16]).is_none());
        assert!(Nonce::from_slice(&[0u8; 32]).is_none());
    }

    #[test]
    fn nonce_base64_display() {
        let nonce = Nonce::random();
        // 24 bytes = 32 base64 chars (no padding)
        assert_eq!(nonce.to_string().len(), 32);
    }

    #[test]
    fn nonce_debug_is_truncated() {
        let nonce = Nonce::from_bytes([0xAB; NONCE_SIZE]);
        let debug = format!("{:?}", nonce);
        assert_eq!(debug.len(), "Nonce()".len() + 8);
    }
}
