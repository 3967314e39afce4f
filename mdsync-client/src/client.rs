//! SyncCore - the per-login owner of the multi-device core.
//!
//! This module provides [`SyncCore`], which wires the task manager,
//! replay protection and multi-device manager to the collaborators the
//! embedding application supplies.
//!
//! # Architecture
//!
//! ```text
//! Transport → ReflectionPump → TaskManager → Task::run → Services
//!                                   ↓
//!                     NonceStore / TaskStore (SQLite)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mdsync_client::{ClientConfig, Collaborators, SyncCore};
//!
//! let core = SyncCore::login(ClientConfig::default(), collaborators).await?;
//! let pump = core.start_reflection_pump();
//!
//! core.multi_device().activate("Laptop").await?;
//! // ...
//! core.logout().await?;
//! ```

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ClientConfig, ConfigError};
use crate::manager::{ManagerError, TaskManager};
use crate::multidevice::{ForwardSecurityControl, MultiDeviceBackend, MultiDeviceManager};
use crate::pump::ReflectionPump;
use crate::services::Services;
use crate::store::{NonceStore, SqliteStore, StoreError, TaskStore};
use crate::task::TaskContext;
use crate::transport::{CloseReason, Transport, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Task manager error.
    #[error("task manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Everything the application injects at login.
#[derive(Clone)]
pub struct Collaborators {
    /// Domain services used by tasks
    pub services: Services,
    /// Authenticated mediator connection
    pub transport: Arc<dyn Transport>,
    /// Server-side device group operations
    pub backend: Arc<dyn MultiDeviceBackend>,
    /// Forward security toggle
    pub forward_security: Arc<dyn ForwardSecurityControl>,
}

/// The multi-device core of one logged-in identity.
pub struct SyncCore {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    nonces: Arc<dyn NonceStore>,
    tasks: Arc<TaskManager>,
    multi_device: Arc<MultiDeviceManager>,
}

impl SyncCore {
    /// Log in using the SQLite database named in the configuration.
    pub async fn login(
        config: ClientConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ClientError> {
        let store = Arc::new(SqliteStore::open(&config.storage.database).await?);
        Self::login_with_stores(config, collaborators, store.clone(), store).await
    }

    /// Log in with explicit stores.
    ///
    /// Tasks persisted by a previous session are queued before this returns.
    pub async fn login_with_stores(
        config: ClientConfig,
        collaborators: Collaborators,
        nonces: Arc<dyn NonceStore>,
        task_store: Arc<dyn TaskStore>,
    ) -> Result<Self, ClientError> {
        let Collaborators {
            services,
            transport,
            backend,
            forward_security,
        } = collaborators;

        let ctx = TaskContext {
            services,
            nonces: Arc::clone(&nonces),
            transport: Arc::clone(&transport),
        };
        let tasks = Arc::new(TaskManager::spawn(
            ctx,
            task_store,
            config.tasks.queue_capacity,
            config.tasks.retry_policy(),
        ));
        let resumed = tasks.resume_persisted().await?;

        info!(
            "Logged in as device '{}' ({} pending tasks)",
            config.device.label, resumed
        );

        Ok(Self {
            config,
            transport,
            nonces,
            tasks,
            multi_device: Arc::new(MultiDeviceManager::new(backend, forward_security)),
        })
    }

    /// Configuration this session was started with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The task manager.
    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// The multi-device manager.
    pub fn multi_device(&self) -> &Arc<MultiDeviceManager> {
        &self.multi_device
    }

    /// The replay-protection store.
    pub fn nonce_store(&self) -> &Arc<dyn NonceStore> {
        &self.nonces
    }

    /// Start feeding reflected envelopes from the transport into the task
    /// manager. The handle resolves with the close reason.
    pub fn start_reflection_pump(&self) -> JoinHandle<CloseReason> {
        let pump = ReflectionPump::new(Arc::clone(&self.transport), Arc::clone(&self.tasks))
            .with_close_listener(Arc::clone(&self.multi_device));
        tokio::spawn(async move { pump.run().await })
    }

    /// Stop the task manager and close the connection.
    ///
    /// Pending serializable tasks stay persisted for the next login.
    pub async fn logout(self) -> Result<(), ClientError> {
        self.tasks.shutdown().await;
        self.transport.close().await?;
        info!("Logged out device '{}'", self.config.device.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{QueueStatus, TaskResult};
    use crate::multidevice::MemoryMultiDeviceBackend;
    use crate::services::MemoryServices;
    use crate::store::{MemoryNonceStore, MemoryTaskStore};
    use crate::task::{TaskData, TaskId, TaskOutcome};
    use crate::transport::MockTransport;
    use mdsync_types::{
        ConversationRef, DeleteMessage, IdentityId, MessageId, MessageType, Nonce,
        OutgoingFrame, ReflectedEnvelope, WirePayload,
    };

    fn me() -> IdentityId {
        IdentityId::new("MEMEMEME").unwrap()
    }

    fn conversation() -> ConversationRef {
        ConversationRef::Contact {
            identity: IdentityId::new("ECHOECHO").unwrap(),
        }
    }

    fn collaborators(transport: &MockTransport, services: &MemoryServices) -> Collaborators {
        let backend = MemoryMultiDeviceBackend::new();
        Collaborators {
            services: Services::in_memory(me(), services.clone()),
            transport: Arc::new(transport.clone()),
            backend: Arc::new(backend.clone()),
            forward_security: Arc::new(backend),
        }
    }

    fn delete_envelope(target: u64, nonce: u8) -> ReflectedEnvelope {
        ReflectedEnvelope {
            message_id: MessageId::from_u64(nonce as u64),
            sender_identity: me(),
            created_at: 1_000,
            msg_type: MessageType::DeleteMessage as u8,
            nonces: vec![Nonce::from_bytes([nonce; 24])],
            payload: DeleteMessage::new(conversation(), MessageId::from_u64(target))
                .to_bytes()
                .unwrap(),
        }
    }

    #[tokio::test]
    async fn login_pump_and_logout() {
        let transport = MockTransport::new();
        let services = MemoryServices::new();
        services.insert_message(conversation(), MessageId::from_u64(7));
        transport.queue_frame(delete_envelope(7, 1).to_bytes().unwrap());

        let core = SyncCore::login_with_stores(
            ClientConfig::default(),
            collaborators(&transport, &services),
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemoryTaskStore::new()),
        )
        .await
        .unwrap();

        let mut completions = core.task_manager().completions();
        let reason = core.start_reflection_pump().await.unwrap();
        assert_eq!(reason, CloseReason::normal());
        assert_eq!(core.multi_device().latest_close_reason(), Some(reason));

        let completion = completions.recv().await.unwrap();
        assert_eq!(
            completion.result,
            TaskResult::Succeeded(TaskOutcome::Completed)
        );
        assert_eq!(services.deleted(), vec![MessageId::from_u64(7)]);
        assert_eq!(core.nonce_store().count().await.unwrap(), 1);

        let manager = Arc::clone(core.task_manager());
        core.logout().await.unwrap();
        assert_eq!(manager.status(), QueueStatus::Stopped);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn login_resumes_persisted_tasks() {
        let transport = MockTransport::new();
        let services = MemoryServices::new();
        services.insert_message(conversation(), MessageId::from_u64(9));

        let task_store = Arc::new(MemoryTaskStore::new());
        let envelope = delete_envelope(9, 3);
        task_store
            .save(
                TaskId::new(),
                &TaskData::Reflected {
                    envelope: envelope.clone(),
                },
            )
            .await
            .unwrap();

        let core = SyncCore::login_with_stores(
            ClientConfig::default(),
            collaborators(&transport, &services),
            Arc::new(MemoryNonceStore::new()),
            task_store.clone(),
        )
        .await
        .unwrap();

        // The store entry is removed once the task has finished.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !task_store.load_all().await.unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(services.deleted(), vec![MessageId::from_u64(9)]);
        assert_eq!(core.task_manager().status(), QueueStatus::Running);
        assert_eq!(
            transport.sent_outgoing(),
            vec![OutgoingFrame::ReflectedAck {
                message_id: envelope.message_id
            }]
        );

        core.logout().await.unwrap();
    }

    #[tokio::test]
    async fn login_opens_sqlite_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.storage.database = dir.path().join("core.db");

        let transport = MockTransport::new();
        let services = MemoryServices::new();
        let core = SyncCore::login(config, collaborators(&transport, &services))
            .await
            .unwrap();

        assert_eq!(core.nonce_store().count().await.unwrap(), 0);
        assert!(dir.path().join("core.db").exists());
        core.logout().await.unwrap();
    }
}
