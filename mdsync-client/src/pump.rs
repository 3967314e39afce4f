//! Inbound reflection pump.
//!
//! Reads envelope frames from the transport and submits one reflected task
//! per envelope. Ends when the connection closes.

use crate::manager::TaskManager;
use crate::multidevice::MultiDeviceManager;
use crate::task::ReflectedTask;
use crate::transport::{CloseReason, Transport, TransportError};
use mdsync_types::ReflectedEnvelope;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Feeds reflected envelopes into the task manager.
pub struct ReflectionPump {
    transport: Arc<dyn Transport>,
    manager: Arc<TaskManager>,
    close_listener: Option<Arc<MultiDeviceManager>>,
}

impl ReflectionPump {
    /// Create a pump reading from `transport`.
    pub fn new(transport: Arc<dyn Transport>, manager: Arc<TaskManager>) -> Self {
        Self {
            transport,
            manager,
            close_listener: None,
        }
    }

    /// Report the close reason to the multi-device manager.
    pub fn with_close_listener(mut self, multi_device: Arc<MultiDeviceManager>) -> Self {
        self.close_listener = Some(multi_device);
        self
    }

    /// Pump until the connection closes and return the close reason.
    pub async fn run(&self) -> CloseReason {
        let mut submitted = 0u64;

        let fallback = loop {
            let frame = match self.transport.recv().await {
                Ok(frame) => frame,
                Err(TransportError::ConnectionClosed) => break None,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    break Some(CloseReason::new(CloseReason::ABNORMAL, e.to_string()));
                }
            };

            let envelope = match ReflectedEnvelope::from_bytes(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping malformed reflected envelope: {}", e);
                    continue;
                }
            };

            debug!(
                "Received reflected {:#04x} message {}",
                envelope.msg_type, envelope.message_id
            );
            if let Err(e) = self.manager.submit(ReflectedTask::new(envelope).into()).await {
                warn!("Stopping reflection pump: {}", e);
                if let Err(e) = self.transport.close().await {
                    warn!("Failed to close transport: {}", e);
                }
                break Some(CloseReason::normal());
            }
            submitted += 1;
        };

        let reason = self
            .transport
            .close_reason()
            .or(fallback)
            .unwrap_or_else(|| CloseReason::new(CloseReason::ABNORMAL, "connection lost"));
        info!(
            "Reflection pump finished after {} messages: {}",
            submitted, reason
        );

        if let Some(multi_device) = &self.close_listener {
            multi_device.report_close_reason(reason.clone());
        }
        reason
    }
}
