//! # mdsync-client
//!
//! Multi-device core for an end-to-end encrypted messenger.
//!
//! Every device of an identity receives, through the mediator server, a
//! reflection of every message any sibling device sent or received. This
//! crate applies those reflections to local state exactly once and in
//! order, and manages the device group itself.
//!
//! ## Features
//!
//! - **Sequential Tasks**: one task at a time, completions in submission order
//! - **Replay Protection**: per-identity nonce store (SQLite or in-memory)
//! - **Reflected Handlers**: delete, receipt/reaction, poll setup, poll vote
//! - **Device Linking**: short-code confirmation with a single resolution
//! - **Multi-Device Lifecycle**: activate, deactivate, list, purge
//! - **Transport Abstraction**: pluggable mediator connection (mock included)
//!
//! ## Example
//!
//! ```ignore
//! use mdsync_client::{ClientConfig, SyncCore};
//!
//! let core = SyncCore::login(ClientConfig::from_file(path)?, collaborators).await?;
//! let pump = core.start_reflection_pump();
//!
//! let devices = core.multi_device().load_linked_devices_info().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod linking;
pub mod manager;
pub mod multidevice;
pub mod pump;
pub mod services;
pub mod store;
pub mod task;
pub mod transport;

pub use client::{ClientError, Collaborators, SyncCore};
pub use config::{ClientConfig, ConfigError, DeviceConfig, StorageConfig, TaskConfig};
pub use linking::{DeviceLinkingSession, LinkingProvisioner};
pub use manager::{
    ManagerError, QueueStatus, TaskCompletion, TaskHandle, TaskManager, TaskResult,
};
pub use multidevice::{
    ForwardSecurityControl, LinkedDeviceInfo, MemoryMultiDeviceBackend, MultiDeviceBackend,
    MultiDeviceError, MultiDeviceManager, MultiDeviceState,
};
pub use pump::ReflectionPump;
pub use services::{MemoryServices, ServiceError, Services};
pub use store::{MemoryNonceStore, MemoryTaskStore, NonceStore, SqliteStore, StoreError, TaskStore};
pub use task::{
    OutgoingVoipCallAnswerTask, ReflectedTask, SkipCause, Task, TaskContext, TaskData, TaskError,
    TaskId, TaskOutcome,
};
pub use transport::{CloseReason, MockTransport, Transport, TransportError};
