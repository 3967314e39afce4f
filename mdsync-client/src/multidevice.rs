//! Multi-device lifecycle: activation, linked devices and close reasons.
//!
//! Activation, deactivation, purge and refresh are mutually exclusive. A
//! second call while one is in flight fails with
//! [`MultiDeviceError::OperationInProgress`] instead of queueing.

use crate::linking::{DeviceLinkingSession, LinkingProvisioner};
use crate::services::ServiceError;
use crate::transport::CloseReason;
use async_trait::async_trait;
use mdsync_core::LinkingError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Close reasons buffered for slow subscribers.
const CLOSE_REASON_BUFFER: usize = 16;

/// Multi-device errors.
#[derive(Debug, Error)]
pub enum MultiDeviceError {
    /// Another activation, deactivation or refresh is running.
    #[error("another multi-device operation is in progress")]
    OperationInProgress,

    /// The operation requires multi-device to be active.
    #[error("multi-device is not active")]
    NotActive,

    /// The mediator backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] ServiceError),

    /// Linking a new device failed.
    #[error("linking failed: {0}")]
    Linking(#[from] LinkingError),
}

/// A device linked to the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedDeviceInfo {
    /// Opaque device id
    pub device_id: u64,
    /// Label chosen by the user
    pub device_label: String,
    /// Platform description, e.g. "Android" or "Desktop"
    pub platform_hint: String,
    /// Unix timestamp (milliseconds) of last activity, if known
    pub last_active_at: Option<u64>,
}

/// Snapshot of the multi-device state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiDeviceState {
    /// Whether multi-device is active for this identity
    pub is_active: bool,
    /// Other devices in the group
    pub linked_devices: Vec<LinkedDeviceInfo>,
}

/// Device group operations against the mediator.
#[async_trait]
pub trait MultiDeviceBackend: Send + Sync {
    /// Register this device in the device group.
    async fn register_device(&self, label: &str) -> Result<(), ServiceError>;

    /// Fetch the other devices in the group.
    async fn linked_devices(&self) -> Result<Vec<LinkedDeviceInfo>, ServiceError>;

    /// Drop every other device from the group.
    async fn drop_other_devices(&self) -> Result<(), ServiceError>;

    /// Remove this device from the group.
    async fn deregister_device(&self) -> Result<(), ServiceError>;
}

/// Forward security toggle.
///
/// Forward security is not supported across linked devices, so it is
/// disabled for as long as multi-device is active.
#[async_trait]
pub trait ForwardSecurityControl: Send + Sync {
    /// Enable or disable forward security for all sessions.
    async fn set_forward_security_enabled(&self, enabled: bool) -> Result<(), ServiceError>;
}

/// Owner of the multi-device state for one login.
pub struct MultiDeviceManager {
    backend: Arc<dyn MultiDeviceBackend>,
    forward_security: Arc<dyn ForwardSecurityControl>,
    state: watch::Sender<MultiDeviceState>,
    operation: Mutex<()>,
    close_reasons: broadcast::Sender<CloseReason>,
    latest_close_reason: StdMutex<Option<CloseReason>>,
}

impl MultiDeviceManager {
    /// Create an inactive manager.
    pub fn new(
        backend: Arc<dyn MultiDeviceBackend>,
        forward_security: Arc<dyn ForwardSecurityControl>,
    ) -> Self {
        let (close_reasons, _) = broadcast::channel(CLOSE_REASON_BUFFER);
        Self {
            backend,
            forward_security,
            state: watch::channel(MultiDeviceState::default()).0,
            operation: Mutex::new(()),
            close_reasons,
            latest_close_reason: StdMutex::new(None),
        }
    }

    /// Whether multi-device is active.
    pub fn is_multi_device_active(&self) -> bool {
        self.state.borrow().is_active
    }

    /// Current state.
    pub fn state(&self) -> MultiDeviceState {
        self.state.borrow().clone()
    }

    /// Observe state snapshots.
    ///
    /// A snapshot is published after every operation, even if unchanged.
    pub fn snapshots(&self) -> watch::Receiver<MultiDeviceState> {
        self.state.subscribe()
    }

    fn publish(&self, is_active: bool, linked_devices: Vec<LinkedDeviceInfo>) {
        self.state.send_replace(MultiDeviceState {
            is_active,
            linked_devices,
        });
    }

    fn republish(&self) {
        self.state.send_modify(|_| {});
    }

    /// Activate multi-device and register this device as `label`.
    ///
    /// On failure, everything provisioned so far is torn down and the state
    /// is inactive with no linked devices.
    pub async fn activate(&self, label: &str) -> Result<(), MultiDeviceError> {
        let _guard = self
            .operation
            .try_lock()
            .map_err(|_| MultiDeviceError::OperationInProgress)?;

        if self.is_multi_device_active() {
            self.republish();
            return Ok(());
        }

        match self.activate_steps(label).await {
            Ok(devices) => {
                info!("Multi-device activated with {} linked devices", devices.len());
                self.publish(true, devices);
                Ok(())
            }
            Err(err) => {
                warn!("Multi-device activation failed: {}", err);
                self.rollback_activation().await;
                self.publish(false, Vec::new());
                Err(err)
            }
        }
    }

    async fn activate_steps(&self, label: &str) -> Result<Vec<LinkedDeviceInfo>, MultiDeviceError> {
        self.forward_security
            .set_forward_security_enabled(false)
            .await?;
        self.backend.register_device(label).await?;
        Ok(self.backend.linked_devices().await?)
    }

    async fn rollback_activation(&self) {
        if let Err(e) = self.backend.deregister_device().await {
            warn!("Rollback: failed to deregister device: {}", e);
        }
        if let Err(e) = self.forward_security.set_forward_security_enabled(true).await {
            warn!("Rollback: failed to re-enable forward security: {}", e);
        }
    }

    /// Drop all other devices, deregister this one and re-enable forward security.
    pub async fn deactivate(&self) -> Result<(), MultiDeviceError> {
        let _guard = self
            .operation
            .try_lock()
            .map_err(|_| MultiDeviceError::OperationInProgress)?;

        if !self.is_multi_device_active() {
            self.republish();
            return Ok(());
        }

        let result = async {
            self.backend.drop_other_devices().await?;
            self.backend.deregister_device().await?;
            self.forward_security
                .set_forward_security_enabled(true)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Multi-device deactivated");
                self.publish(false, Vec::new());
                Ok(())
            }
            Err(err) => {
                warn!("Multi-device deactivation failed: {}", err);
                self.refresh_after_failure().await;
                Err(err.into())
            }
        }
    }

    /// Fetch the linked devices and publish them.
    ///
    /// Returns an empty list without contacting the backend when inactive.
    pub async fn load_linked_devices_info(&self) -> Result<Vec<LinkedDeviceInfo>, MultiDeviceError> {
        let _guard = self
            .operation
            .try_lock()
            .map_err(|_| MultiDeviceError::OperationInProgress)?;

        self.refresh().await
    }

    async fn refresh(&self) -> Result<Vec<LinkedDeviceInfo>, MultiDeviceError> {
        if !self.is_multi_device_active() {
            self.republish();
            return Ok(Vec::new());
        }

        match self.backend.linked_devices().await {
            Ok(devices) => {
                self.publish(true, devices.clone());
                Ok(devices)
            }
            Err(err) => {
                self.republish();
                Err(err.into())
            }
        }
    }

    async fn refresh_after_failure(&self) {
        match self.backend.linked_devices().await {
            Ok(devices) => self.publish(true, devices),
            Err(_) => self.republish(),
        }
    }

    /// Drop every other device while staying active.
    pub async fn purge(&self) -> Result<(), MultiDeviceError> {
        let _guard = self
            .operation
            .try_lock()
            .map_err(|_| MultiDeviceError::OperationInProgress)?;

        if !self.is_multi_device_active() {
            self.republish();
            return Err(MultiDeviceError::NotActive);
        }

        if let Err(err) = self.backend.drop_other_devices().await {
            self.republish();
            return Err(err.into());
        }
        info!("Dropped all other devices");
        self.refresh().await.map(|_| ())
    }

    /// Link a new device through `session`, then refresh the device list.
    ///
    /// The operator confirmation may take a long time, so other operations
    /// are only excluded during the final refresh.
    pub async fn link_device<P: LinkingProvisioner>(
        &self,
        session: &DeviceLinkingSession,
        provisioner: &P,
    ) -> Result<LinkedDeviceInfo, MultiDeviceError> {
        if !self.is_multi_device_active() {
            session.cancel("multi-device is not active");
            return Err(MultiDeviceError::NotActive);
        }

        let device = session.run(provisioner).await?;
        info!("Linked device {} ({})", device.device_label, device.platform_hint);

        let _guard = self.operation.lock().await;
        if let Err(e) = self.refresh().await {
            warn!("Failed to refresh linked devices after linking: {}", e);
            self.state.send_modify(|state| {
                if !state.linked_devices.contains(&device) {
                    state.linked_devices.push(device.clone());
                }
            });
        }
        Ok(device)
    }

    /// Record why the server closed the connection.
    pub fn report_close_reason(&self, reason: CloseReason) {
        info!("Connection closed: {}", reason);
        *self
            .latest_close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        let _ = self.close_reasons.send(reason);
    }

    /// Subscribe to close reasons.
    pub fn close_reasons(&self) -> broadcast::Receiver<CloseReason> {
        self.close_reasons.subscribe()
    }

    /// The most recent close reason.
    pub fn latest_close_reason(&self) -> Option<CloseReason> {
        self.latest_close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Activate or deactivate on a background task.
    pub fn set_multi_device_state(
        self: &Arc<Self>,
        active: bool,
        label: impl Into<String>,
    ) -> JoinHandle<Result<(), MultiDeviceError>> {
        let manager = Arc::clone(self);
        let label = label.into();
        tokio::spawn(async move {
            if active {
                manager.activate(&label).await
            } else {
                manager.deactivate().await
            }
        })
    }
}

/// In-memory device group for tests and the command line.
#[derive(Debug, Clone, Default)]
pub struct MemoryMultiDeviceBackend {
    inner: Arc<StdMutex<MemoryBackendInner>>,
}

#[derive(Debug, Default)]
struct MemoryBackendInner {
    registered: Option<String>,
    devices: HashMap<u64, LinkedDeviceInfo>,
    forward_security: Option<bool>,
    failures: HashMap<&'static str, ServiceError>,
}

impl MemoryMultiDeviceBackend {
    /// Create an empty device group.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str) -> Result<(), ServiceError> {
        match self.lock().failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Add another device to the group.
    pub fn add_device(&self, device: LinkedDeviceInfo) {
        self.lock().devices.insert(device.device_id, device);
    }

    /// Label this device registered with, if registered.
    pub fn registered_label(&self) -> Option<String> {
        self.lock().registered.clone()
    }

    /// Last forward security setting, if ever set.
    pub fn forward_security_enabled(&self) -> Option<bool> {
        self.lock().forward_security
    }

    /// Fail the next call to `operation` ("register", "fetch", "drop",
    /// "deregister" or "forward_security").
    pub fn fail_next(&self, operation: &'static str, error: ServiceError) {
        self.lock().failures.insert(operation, error);
    }
}

#[async_trait]
impl MultiDeviceBackend for MemoryMultiDeviceBackend {
    async fn register_device(&self, label: &str) -> Result<(), ServiceError> {
        self.check("register")?;
        self.lock().registered = Some(label.to_string());
        Ok(())
    }

    async fn linked_devices(&self) -> Result<Vec<LinkedDeviceInfo>, ServiceError> {
        self.check("fetch")?;
        let mut devices: Vec<_> = self.lock().devices.values().cloned().collect();
        devices.sort_by_key(|d| d.device_id);
        Ok(devices)
    }

    async fn drop_other_devices(&self) -> Result<(), ServiceError> {
        self.check("drop")?;
        self.lock().devices.clear();
        Ok(())
    }

    async fn deregister_device(&self) -> Result<(), ServiceError> {
        self.check("deregister")?;
        self.lock().registered = None;
        Ok(())
    }
}

#[async_trait]
impl ForwardSecurityControl for MemoryMultiDeviceBackend {
    async fn set_forward_security_enabled(&self, enabled: bool) -> Result<(), ServiceError> {
        self.check("forward_security")?;
        self.lock().forward_security = Some(enabled);
        Ok(())
    }
}
