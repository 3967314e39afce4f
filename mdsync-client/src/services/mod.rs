//! Domain collaborators the reflected tasks apply their effects through.
//!
//! The core never touches message storage, polls, conversations or call
//! state directly. Everything goes through these traits, injected at
//! construction time as a [`Services`] bundle.

mod memory;

pub use memory::{MemoryServices, RecordedReaction, StaticIdentity};

use std::sync::Arc;

use async_trait::async_trait;
use mdsync_core::{MessageState, ReflectedKind};
use mdsync_types::{
    ConversationRef, DeleteMessage, DeliveryReceipt, IdentityId, MessageId, PollChoice, PollSetup,
    PollVote, WireError, WirePayload,
};
use thiserror::Error;

/// Errors reported by domain collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation may succeed if tried again.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// The operation failed permanently.
    #[error("service failure: {0}")]
    Failed(String),
}

/// A message known to the local message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Conversation the message belongs to
    pub conversation: ConversationRef,
    /// Message id
    pub message_id: MessageId,
    /// Whether the contents were already deleted
    pub deleted: bool,
}

/// A poll to be created locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    /// Conversation the poll is posted to
    pub conversation: ConversationRef,
    /// Identity that created the poll
    pub creator: IdentityId,
    /// Poll id, unique per creator
    pub poll_id: u64,
    /// Poll question
    pub description: String,
    /// Answer options
    pub choices: Vec<PollChoice>,
    /// Whether more than one choice may be selected
    pub multiple_choice: bool,
    /// Unix timestamp (milliseconds) of creation
    pub created_at: u64,
}

/// A vote to be recorded locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    /// Conversation the poll lives in
    pub conversation: ConversationRef,
    /// Identity that created the poll
    pub poll_creator: IdentityId,
    /// Poll id, unique per creator
    pub poll_id: u64,
    /// Identity casting the vote
    pub voter: IdentityId,
    /// Selected choice ids
    pub choice_ids: Vec<u32>,
}

/// A decoded reflected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    /// Delete message contents
    Delete(DeleteMessage),
    /// Delivery receipt or reaction
    DeliveryReceipt(DeliveryReceipt),
    /// Poll creation
    PollSetup(PollSetup),
    /// Poll vote
    PollVote(PollVote),
}

impl DecodedMessage {
    /// Conversation the payload refers to.
    pub fn conversation(&self) -> &ConversationRef {
        match self {
            DecodedMessage::Delete(m) => &m.conversation,
            DecodedMessage::DeliveryReceipt(m) => &m.conversation,
            DecodedMessage::PollSetup(m) => &m.conversation,
            DecodedMessage::PollVote(m) => &m.conversation,
        }
    }
}

/// Decodes typed payloads from reflected envelope bytes.
pub trait MessageDecoder: Send + Sync {
    /// Decode the payload for the given task kind.
    fn decode(&self, kind: ReflectedKind, payload: &[u8]) -> Result<DecodedMessage, WireError>;
}

/// Decoder for the MessagePack payload encoding used on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireDecoder;

impl MessageDecoder for WireDecoder {
    fn decode(&self, kind: ReflectedKind, payload: &[u8]) -> Result<DecodedMessage, WireError> {
        match kind {
            ReflectedKind::Delete => DeleteMessage::from_bytes(payload).map(DecodedMessage::Delete),
            ReflectedKind::DeliveryReceipt => {
                DeliveryReceipt::from_bytes(payload).map(DecodedMessage::DeliveryReceipt)
            }
            ReflectedKind::PollSetup => PollSetup::from_bytes(payload).map(DecodedMessage::PollSetup),
            ReflectedKind::PollVote => PollVote::from_bytes(payload).map(DecodedMessage::PollVote),
        }
    }
}

/// Local message storage.
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Look up a message in a conversation.
    async fn find_message(
        &self,
        conversation: &ConversationRef,
        message_id: &MessageId,
    ) -> Result<Option<StoredMessage>, ServiceError>;

    /// Delete the contents of a message, keeping a placeholder.
    async fn delete_message_contents(
        &self,
        message: &StoredMessage,
        deleted_at: u64,
    ) -> Result<(), ServiceError>;

    /// Attach a reaction by `reactor` to a message.
    ///
    /// Must be idempotent per (message, reactor, state).
    async fn add_reaction(
        &self,
        message: &StoredMessage,
        state: MessageState,
        reactor: &IdentityId,
        reacted_at: u64,
    ) -> Result<(), ServiceError>;
}

/// Poll storage.
#[async_trait]
pub trait BallotService: Send + Sync {
    /// Create a poll.
    ///
    /// Must be idempotent per (creator, poll id): a reflected poll setup
    /// whose conversation bump fails is retried and creates the poll again.
    async fn create_poll(&self, poll: Poll) -> Result<(), ServiceError>;

    /// Record a vote. Idempotent per (poll, voter, choices).
    async fn vote(&self, vote: Vote) -> Result<(), ServiceError>;
}

/// Conversation metadata.
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Move the conversation's last-update timestamp forward.
    async fn bump_last_update(
        &self,
        conversation: &ConversationRef,
        at: u64,
    ) -> Result<(), ServiceError>;
}

/// Call state bookkeeping.
#[async_trait]
pub trait CallStateService: Send + Sync {
    /// Remember a message id that must be delivered for the call to proceed.
    async fn add_required_message_id(&self, call_id: u32, message_id: MessageId);
}

/// The identity of the logged in user.
pub trait IdentityProvider: Send + Sync {
    /// Local identity. Scope for replay-protection nonces.
    fn identity(&self) -> IdentityId;
}

/// All domain collaborators, injected at construction.
#[derive(Clone)]
pub struct Services {
    /// Local identity
    pub identity: Arc<dyn IdentityProvider>,
    /// Payload decoder
    pub decoder: Arc<dyn MessageDecoder>,
    /// Message storage
    pub messages: Arc<dyn MessageService>,
    /// Poll storage
    pub ballots: Arc<dyn BallotService>,
    /// Conversation metadata
    pub conversations: Arc<dyn ConversationService>,
    /// Call state
    pub calls: Arc<dyn CallStateService>,
}

impl Services {
    /// Wire every collaborator to the same in-memory implementation.
    pub fn in_memory(identity: IdentityId, services: MemoryServices) -> Self {
        let shared = Arc::new(services);
        Self {
            identity: Arc::new(StaticIdentity(identity)),
            decoder: Arc::new(WireDecoder),
            messages: shared.clone(),
            ballots: shared.clone(),
            conversations: shared.clone(),
            calls: shared,
        }
    }
}
