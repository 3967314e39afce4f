//! Outgoing call answer.

use super::{TaskContext, TaskError, TaskOutcome};
use mdsync_types::{
    CallAnswerAction, IdentityId, MessageId, MessageType, OutgoingFrame, VoipCallAnswer,
    WirePayload,
};
use tracing::info;

/// Send a call answer to the caller.
///
/// Ephemeral: a call answer is only meaningful while the call is ringing,
/// so it is never persisted and never retried.
#[derive(Debug, Clone)]
pub struct OutgoingVoipCallAnswerTask {
    to_identity: IdentityId,
    answer: VoipCallAnswer,
}

impl OutgoingVoipCallAnswerTask {
    /// Create a task answering a call from `to_identity`.
    pub fn new(to_identity: IdentityId, answer: VoipCallAnswer) -> Self {
        Self {
            to_identity,
            answer,
        }
    }

    pub(super) fn describe(&self) -> String {
        let action = match self.answer.action {
            CallAnswerAction::Accept => "accept",
            CallAnswerAction::Reject { .. } => "reject",
        };
        format!(
            "{} call {} from {}",
            action, self.answer.call_id, self.to_identity
        )
    }

    pub(super) async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let message_id = MessageId::random();
        ctx.services
            .calls
            .add_required_message_id(self.answer.call_id, message_id)
            .await;

        let frame = OutgoingFrame::Message {
            recipient: self.to_identity.clone(),
            msg_type: MessageType::VoipCallAnswer as u8,
            message_id,
            payload: self.answer.to_bytes()?,
        };
        ctx.transport.send(&frame.to_bytes()?).await?;

        info!("Sent call answer {} for call {}", message_id, self.answer.call_id);
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{MemoryServices, Services};
    use crate::store::MemoryNonceStore;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    fn context(services: &MemoryServices, transport: &MockTransport) -> TaskContext {
        TaskContext {
            services: Services::in_memory(IdentityId::new("MEMEMEME").unwrap(), services.clone()),
            nonces: Arc::new(MemoryNonceStore::new()),
            transport: Arc::new(transport.clone()),
        }
    }

    #[tokio::test]
    async fn answer_is_sent_and_registered() {
        let services = MemoryServices::new();
        let transport = MockTransport::new();
        let caller = IdentityId::new("CALLER01").unwrap();
        let task = OutgoingVoipCallAnswerTask::new(
            caller.clone(),
            VoipCallAnswer::new(11, CallAnswerAction::Reject { reason: 2 }),
        );

        assert_eq!(
            task.run(&context(&services, &transport)).await.unwrap(),
            TaskOutcome::Completed
        );

        let required = services.required_message_ids();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].0, 11);

        match transport.sent_outgoing().as_slice() {
            [OutgoingFrame::Message {
                recipient,
                msg_type,
                message_id,
                payload,
            }] => {
                assert_eq!(recipient, &caller);
                assert_eq!(*msg_type, 0x61);
                assert_eq!(*message_id, required[0].1);
                let answer = VoipCallAnswer::from_bytes(payload).unwrap();
                assert_eq!(answer.action, CallAnswerAction::Reject { reason: 2 });
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_failure_is_transient() {
        let services = MemoryServices::new();
        let transport = MockTransport::new();
        transport.fail_sends(1);
        let task = OutgoingVoipCallAnswerTask::new(
            IdentityId::new("CALLER01").unwrap(),
            VoipCallAnswer::new(1, CallAnswerAction::Accept),
        );

        let err = task.run(&context(&services, &transport)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn describe_names_action() {
        let task = OutgoingVoipCallAnswerTask::new(
            IdentityId::new("CALLER01").unwrap(),
            VoipCallAnswer::new(3, CallAnswerAction::Accept),
        );
        assert_eq!(task.describe(), "accept call 3 from CALLER01");
    }
}
