//! In-memory collaborators for tests and the command line replay tool.
//!
//! Every effect is recorded so callers can assert exactly what happened.

use super::{
    BallotService, CallStateService, ConversationService, IdentityProvider, MessageService, Poll,
    ServiceError, StoredMessage, Vote,
};
use async_trait::async_trait;
use mdsync_core::MessageState;
use mdsync_types::{ConversationRef, IdentityId, MessageId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Fixed local identity.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub IdentityId);

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> IdentityId {
        self.0.clone()
    }
}

/// A reaction applied through [`MessageService::add_reaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedReaction {
    /// Message reacted to
    pub message_id: MessageId,
    /// Reaction
    pub state: MessageState,
    /// Identity reacting
    pub reactor: IdentityId,
    /// Unix timestamp (milliseconds)
    pub reacted_at: u64,
}

/// Recording in-memory implementation of every domain collaborator.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryServices {
    inner: Arc<Mutex<MemoryServicesInner>>,
}

#[derive(Debug, Default)]
struct MemoryServicesInner {
    messages: HashMap<(ConversationRef, MessageId), StoredMessage>,
    deleted: Vec<MessageId>,
    reactions: Vec<RecordedReaction>,
    polls: Vec<Poll>,
    votes: HashMap<(IdentityId, u64, IdentityId), Vec<u32>>,
    vote_calls: usize,
    bumps: Vec<(ConversationRef, u64)>,
    required_message_ids: Vec<(u32, MessageId)>,
    failures: VecDeque<Result<(), ServiceError>>,
}

impl MemoryServicesInner {
    fn injected_failure(&mut self) -> Result<(), ServiceError> {
        self.failures.pop_front().unwrap_or(Ok(()))
    }
}

impl MemoryServices {
    /// Create empty services.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryServicesInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a message known to the message store.
    pub fn insert_message(&self, conversation: ConversationRef, message_id: MessageId) {
        let stored = StoredMessage {
            conversation: conversation.clone(),
            message_id,
            deleted: false,
        };
        self.lock().messages.insert((conversation, message_id), stored);
    }

    /// Look up a stored message.
    pub fn message(&self, conversation: &ConversationRef, message_id: &MessageId) -> Option<StoredMessage> {
        self.lock()
            .messages
            .get(&(conversation.clone(), *message_id))
            .cloned()
    }

    /// Ids of messages whose contents were deleted, in order.
    pub fn deleted(&self) -> Vec<MessageId> {
        self.lock().deleted.clone()
    }

    /// Reactions applied, in order.
    pub fn reactions(&self) -> Vec<RecordedReaction> {
        self.lock().reactions.clone()
    }

    /// Polls created, in order.
    pub fn polls(&self) -> Vec<Poll> {
        self.lock().polls.clone()
    }

    /// Votes recorded for a poll, one entry per voter.
    pub fn votes(&self, poll_creator: &IdentityId, poll_id: u64) -> Vec<(IdentityId, Vec<u32>)> {
        let mut votes: Vec<_> = self
            .lock()
            .votes
            .iter()
            .filter(|((creator, id, _), _)| creator == poll_creator && *id == poll_id)
            .map(|((_, _, voter), choices)| (voter.clone(), choices.clone()))
            .collect();
        votes.sort();
        votes
    }

    /// Number of times `vote` reached the ballot service.
    pub fn vote_calls(&self) -> usize {
        self.lock().vote_calls
    }

    /// Conversations bumped, in order.
    pub fn bumps(&self) -> Vec<(ConversationRef, u64)> {
        self.lock().bumps.clone()
    }

    /// Required message ids registered per call.
    pub fn required_message_ids(&self) -> Vec<(u32, MessageId)> {
        self.lock().required_message_ids.clone()
    }

    /// Fail the next effect call with the given error.
    pub fn fail_next_effect(&self, error: ServiceError) {
        self.lock().failures.push_back(Err(error));
    }

    /// Let the next effect call through, so a queued failure hits a later one.
    pub fn pass_next_effect(&self) {
        self.lock().failures.push_back(Ok(()));
    }
}

#[async_trait]
impl MessageService for MemoryServices {
    async fn find_message(
        &self,
        conversation: &ConversationRef,
        message_id: &MessageId,
    ) -> Result<Option<StoredMessage>, ServiceError> {
        Ok(self.message(conversation, message_id))
    }

    async fn delete_message_contents(
        &self,
        message: &StoredMessage,
        _deleted_at: u64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        let key = (message.conversation.clone(), message.message_id);
        let stored = inner
            .messages
            .get_mut(&key)
            .ok_or_else(|| ServiceError::NotFound(message.message_id.to_string()))?;
        stored.deleted = true;
        inner.deleted.push(message.message_id);
        Ok(())
    }

    async fn add_reaction(
        &self,
        message: &StoredMessage,
        state: MessageState,
        reactor: &IdentityId,
        reacted_at: u64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        let exists = inner.reactions.iter().any(|r| {
            r.message_id == message.message_id && r.state == state && &r.reactor == reactor
        });
        if !exists {
            inner.reactions.push(RecordedReaction {
                message_id: message.message_id,
                state,
                reactor: reactor.clone(),
                reacted_at,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BallotService for MemoryServices {
    async fn create_poll(&self, poll: Poll) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        inner
            .polls
            .retain(|p| !(p.creator == poll.creator && p.poll_id == poll.poll_id));
        inner.polls.push(poll);
        Ok(())
    }

    async fn vote(&self, vote: Vote) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        inner.vote_calls += 1;
        inner
            .votes
            .insert((vote.poll_creator, vote.poll_id, vote.voter), vote.choice_ids);
        Ok(())
    }
}

#[async_trait]
impl ConversationService for MemoryServices {
    async fn bump_last_update(
        &self,
        conversation: &ConversationRef,
        at: u64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        inner.bumps.push((conversation.clone(), at));
        Ok(())
    }
}

#[async_trait]
impl CallStateService for MemoryServices {
    async fn add_required_message_id(&self, call_id: u32, message_id: MessageId) {
        self.lock().required_message_ids.push((call_id, message_id));
    }
}
