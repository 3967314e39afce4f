//! Processing of messages reflected by another device of the same identity.
//!
//! Every reflected task follows the same pipeline:
//! 1. dispatch on the type tag (unknown tags are skipped)
//! 2. decode the payload and check its conversation scope
//! 3. record the replay-protection nonces (duplicates stop here)
//! 4. apply the domain effect
//! 5. bump the conversation if the message asks for it
//! 6. acknowledge the reflection to the mediator
//!
//! If step 4 or 5 fails, the nonces recorded in step 3 are removed again so
//! a redelivery is processed instead of being discarded as a replay.

use super::{SkipCause, TaskContext, TaskError, TaskOutcome};
use crate::services::{DecodedMessage, Poll, Vote};
use mdsync_core::{dispatch, reaction_for_receipt, ConversationScope, Dispatch, ReflectedKind};
use mdsync_types::{
    ConversationRef, DeleteMessage, DeliveryReceipt, IdentityId, MessageFlags, OutgoingFrame,
    PollSetup, PollVote, ReflectedEnvelope,
};
use tracing::{debug, info, warn};

/// A decoded reflected message attributed to the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectedMessage {
    /// Delete message contents.
    Delete(DeleteMessage),
    /// Reaction applied by us.
    DeliveryReceipt {
        /// Decoded receipt
        receipt: DeliveryReceipt,
        /// Local identity
        reactor: IdentityId,
    },
    /// Poll created by us.
    PollSetup {
        /// Decoded poll
        setup: PollSetup,
        /// Local identity
        creator: IdentityId,
    },
    /// Vote cast by us.
    PollVote {
        /// Decoded vote
        vote: PollVote,
        /// Local identity
        voter: IdentityId,
    },
}

impl ReflectedMessage {
    /// Attribute a decoded payload to the local identity.
    pub fn attribute(message: DecodedMessage, identity: IdentityId) -> Self {
        match message {
            DecodedMessage::Delete(delete) => ReflectedMessage::Delete(delete),
            DecodedMessage::DeliveryReceipt(receipt) => ReflectedMessage::DeliveryReceipt {
                receipt,
                reactor: identity,
            },
            DecodedMessage::PollSetup(setup) => ReflectedMessage::PollSetup {
                setup,
                creator: identity,
            },
            DecodedMessage::PollVote(vote) => ReflectedMessage::PollVote {
                vote,
                voter: identity,
            },
        }
    }

    /// Whether the nonces must be recorded before applying the effect.
    pub fn store_nonces(&self) -> bool {
        match self {
            ReflectedMessage::Delete(m) => m.protect_against_replay(),
            ReflectedMessage::DeliveryReceipt { receipt, .. } => receipt.protect_against_replay(),
            ReflectedMessage::PollSetup { setup, .. } => setup.protect_against_replay(),
            ReflectedMessage::PollVote { vote, .. } => vote.protect_against_replay(),
        }
    }

    /// Whether the conversation's last-update timestamp moves forward.
    ///
    /// Receipts never bump, whatever their flags say.
    pub fn should_bump_last_update(&self) -> bool {
        match self {
            ReflectedMessage::Delete(m) => m.bump_last_update(),
            ReflectedMessage::DeliveryReceipt { .. } => false,
            ReflectedMessage::PollSetup { setup, .. } => setup.bump_last_update(),
            ReflectedMessage::PollVote { vote, .. } => vote.bump_last_update(),
        }
    }

    /// Conversation the message belongs to.
    pub fn conversation(&self) -> &ConversationRef {
        match self {
            ReflectedMessage::Delete(m) => &m.conversation,
            ReflectedMessage::DeliveryReceipt { receipt, .. } => &receipt.conversation,
            ReflectedMessage::PollSetup { setup, .. } => &setup.conversation,
            ReflectedMessage::PollVote { vote, .. } => &vote.conversation,
        }
    }
}

/// Task for one reflected envelope.
#[derive(Debug, Clone)]
pub struct ReflectedTask {
    envelope: ReflectedEnvelope,
}

impl ReflectedTask {
    /// Create a task for a received envelope.
    pub fn new(envelope: ReflectedEnvelope) -> Self {
        Self { envelope }
    }

    /// The envelope being processed.
    pub fn envelope(&self) -> &ReflectedEnvelope {
        &self.envelope
    }

    pub(super) fn describe(&self) -> String {
        format!(
            "reflected {:#04x} message {}",
            self.envelope.msg_type, self.envelope.message_id
        )
    }

    pub(super) fn serialize(&self) -> super::TaskData {
        super::TaskData::Reflected {
            envelope: self.envelope.clone(),
        }
    }

    pub(super) async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let outcome = match dispatch(self.envelope.msg_type) {
            Dispatch::Skip(reason) => {
                debug!(
                    "Skipping message {}: {:?}",
                    self.envelope.message_id, reason
                );
                TaskOutcome::Skipped(SkipCause::Dispatch(reason))
            }
            Dispatch::Handle { kind, scope } => self.process(kind, scope, ctx).await?,
        };

        let ack = OutgoingFrame::ReflectedAck {
            message_id: self.envelope.message_id,
        };
        ctx.transport.send(&ack.to_bytes()?).await?;

        Ok(outcome)
    }

    async fn process(
        &self,
        kind: ReflectedKind,
        scope: ConversationScope,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        let message_id = self.envelope.message_id;

        let decoded = match ctx.services.decoder.decode(kind, &self.envelope.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Message {} error: failed to decode: {}", message_id, e);
                return Ok(TaskOutcome::Skipped(SkipCause::Decode(e.to_string())));
            }
        };

        if !scope.matches(decoded.conversation()) {
            warn!(
                "Message {} error: {:?} tag carries {} conversation",
                message_id,
                scope,
                decoded.conversation()
            );
            return Ok(TaskOutcome::Skipped(SkipCause::Decode(
                "conversation scope does not match message type".into(),
            )));
        }

        let identity = ctx.services.identity.identity();
        let message = ReflectedMessage::attribute(decoded, identity.clone());
        let nonces = &self.envelope.nonces;

        if message.store_nonces() {
            if nonces.is_empty() {
                warn!("Message {} error: no nonces to protect against replay", message_id);
                return Ok(TaskOutcome::Skipped(SkipCause::MissingNonces));
            }
            if !ctx.nonces.insert_all(&identity, nonces).await? {
                info!("Skipping message {}: nonce already used", message_id);
                return Ok(TaskOutcome::Duplicate);
            }
        }

        match self.apply(&message, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if message.store_nonces() {
                    ctx.nonces.remove_all(&identity, nonces).await?;
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        message: &ReflectedMessage,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        let created_at = self.envelope.created_at;
        let services = &ctx.services;

        let outcome = match message {
            ReflectedMessage::Delete(delete) => {
                match services
                    .messages
                    .find_message(&delete.conversation, &delete.target_message_id)
                    .await?
                {
                    Some(stored) if !stored.deleted => {
                        services
                            .messages
                            .delete_message_contents(&stored, created_at)
                            .await?;
                        TaskOutcome::Completed
                    }
                    Some(_) => {
                        debug!("Message {} already deleted", delete.target_message_id);
                        TaskOutcome::Completed
                    }
                    None => {
                        debug!(
                            "Message {} to delete not found in {}",
                            delete.target_message_id, delete.conversation
                        );
                        TaskOutcome::Completed
                    }
                }
            }
            ReflectedMessage::DeliveryReceipt { receipt, reactor } => {
                let state = match reaction_for_receipt(receipt.receipt_type) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("Message {} error: {}", self.envelope.message_id, e);
                        return Ok(TaskOutcome::Skipped(SkipCause::UnsupportedReceipt(e)));
                    }
                };

                for target in &receipt.message_ids {
                    match services
                        .messages
                        .find_message(&receipt.conversation, target)
                        .await?
                    {
                        Some(stored) => {
                            services
                                .messages
                                .add_reaction(&stored, state, reactor, created_at)
                                .await?;
                        }
                        None => warn!("Message {} to react to not found", target),
                    }
                }
                TaskOutcome::Completed
            }
            ReflectedMessage::PollSetup { setup, creator } => {
                services
                    .ballots
                    .create_poll(Poll {
                        conversation: setup.conversation.clone(),
                        creator: creator.clone(),
                        poll_id: setup.poll_id,
                        description: setup.description.clone(),
                        choices: setup.choices.clone(),
                        multiple_choice: setup.multiple_choice,
                        created_at,
                    })
                    .await?;
                TaskOutcome::Completed
            }
            ReflectedMessage::PollVote { vote, voter } => {
                services
                    .ballots
                    .vote(Vote {
                        conversation: vote.conversation.clone(),
                        poll_creator: vote.poll_creator.clone(),
                        poll_id: vote.poll_id,
                        voter: voter.clone(),
                        choice_ids: vote.choice_ids.clone(),
                    })
                    .await?;
                TaskOutcome::Completed
            }
        };

        if message.should_bump_last_update() {
            services
                .conversations
                .bump_last_update(message.conversation(), created_at)
                .await?;
        }

        Ok(outcome)
    }
}
