//! Device linking session.
//!
//! Drives the pure [`LinkingState`] machine and owns the single-fire
//! confirmation signal the provisioning side waits on. The signal resolves
//! exactly once: by the operator, by a failure, by cancellation or by
//! dropping the last operator handle.

use crate::multidevice::LinkedDeviceInfo;
use async_trait::async_trait;
use mdsync_core::{LinkingAction, LinkingError, LinkingEvent, LinkingState, RendezvousPathHash, ShortCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

type Confirmation = Result<(), LinkingError>;

/// Transport side of a linking session.
#[async_trait]
pub trait LinkingProvisioner: Send + Sync {
    /// Establish the rendezvous path with the new device.
    async fn establish_rendezvous(&self) -> Result<RendezvousPathHash, LinkingError>;

    /// Send provisioning material to the new device once confirmed.
    async fn exchange_provisioning(&self) -> Result<LinkedDeviceInfo, LinkingError>;
}

/// Single-resolution completion cell.
#[derive(Debug)]
struct ConfirmationCell {
    sender: Mutex<Option<oneshot::Sender<Confirmation>>>,
    receiver: Mutex<Option<oneshot::Receiver<Confirmation>>>,
}

impl ConfirmationCell {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// Resolve the cell. Returns `false` if it was already resolved.
    fn resolve(&self, value: Confirmation) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn take_receiver(&self) -> Option<oneshot::Receiver<Confirmation>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Debug)]
struct SessionInner {
    status: watch::Sender<LinkingState>,
    confirmation: ConfirmationCell,
    /// Live handles not currently inside `wait_for_confirmation`.
    operators: AtomicUsize,
}

/// One device linking attempt.
///
/// Clones share the session. A handle that is waiting for confirmation does
/// not keep the session alive: once every other handle is dropped, the
/// session is cancelled and the waiter resolves with
/// [`LinkingError::Cancelled`].
#[derive(Debug)]
pub struct DeviceLinkingSession {
    inner: Arc<SessionInner>,
}

impl Clone for DeviceLinkingSession {
    fn clone(&self) -> Self {
        self.inner.operators.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for DeviceLinkingSession {
    fn drop(&mut self) {
        self.release_operator();
    }
}

impl Default for DeviceLinkingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLinkingSession {
    /// Create a session in the Connecting state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                status: watch::channel(LinkingState::new()).0,
                confirmation: ConfirmationCell::new(),
                operators: AtomicUsize::new(1),
            }),
        }
    }

    /// Current state.
    pub fn status(&self) -> LinkingState {
        self.inner.status.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkingState> {
        self.inner.status.subscribe()
    }

    /// Short code to display, while waiting for the operator.
    pub fn short_code(&self) -> Option<ShortCode> {
        self.inner.status.borrow().short_code()
    }

    /// Give up one operator handle; the last one cancels an unresolved session.
    fn release_operator(&self) {
        let previous = self.inner.operators.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && !self.inner.confirmation.is_resolved() {
            debug!("Last linking session handle dropped");
            self.cancel("session dropped");
        }
    }

    /// Apply an event and return the value it resolved the confirmation
    /// signal with, if any.
    fn apply(&self, event: LinkingEvent) -> Option<Confirmation> {
        let mut actions = Vec::new();
        self.inner.status.send_if_modified(|state| {
            let (next, emitted) = state.clone().on_event(event);
            actions = emitted;
            let changed = next != *state;
            *state = next;
            changed
        });

        let mut resolved = None;
        for action in actions {
            let value = match action {
                LinkingAction::ShowShortCode(code) => {
                    info!("Linking short code: {}", code);
                    continue;
                }
                LinkingAction::ResolveConfirmation => Ok(()),
                LinkingAction::RejectConfirmation(err) => Err(err),
            };
            if self.inner.confirmation.resolve(value.clone()) {
                resolved = Some(value);
            }
        }
        resolved
    }

    /// Report that the rendezvous path was established.
    pub fn rendezvous_established(&self, rph: RendezvousPathHash) -> Option<ShortCode> {
        self.apply(LinkingEvent::RendezvousEstablished { rph });
        self.short_code()
    }

    /// The operator confirmed that both short codes match.
    ///
    /// Returns `true` only for the call that resolved the signal.
    pub fn confirm_rendezvous_path(&self) -> bool {
        self.apply(LinkingEvent::OperatorConfirmed).is_some()
    }

    /// The operator reported that the short codes differ.
    ///
    /// Returns `true` only for the call that resolved the signal. The
    /// session ends in Failed whether or not anyone is waiting.
    pub fn decline_rendezvous_path(&self) -> bool {
        let Some(outcome) = self.apply(LinkingEvent::OperatorDeclined) else {
            return false;
        };
        warn!("Rendezvous path declined by operator");
        if let Err(cause) = outcome {
            self.apply(LinkingEvent::Failed { cause });
        }
        true
    }

    /// Fail the session with the given cause.
    pub fn fail(&self, cause: LinkingError) {
        self.apply(LinkingEvent::Failed {
            cause: cause.clone(),
        });
        self.inner.confirmation.resolve(Err(cause));
    }

    /// Cancel the session.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.fail(LinkingError::Cancelled(reason.into()));
    }

    /// Report that provisioning finished. Only accepted after confirmation.
    pub fn complete(&self) -> bool {
        self.apply(LinkingEvent::ProvisioningCompleted);
        self.status() == LinkingState::Completed
    }

    /// Wait until the operator confirms or declines.
    ///
    /// Can be awaited once. Dropping the returned future before it resolves
    /// cancels the session. While waiting, this handle does not count as an
    /// operator handle.
    pub async fn wait_for_confirmation(&self) -> Result<(), LinkingError> {
        let receiver = self
            .inner
            .confirmation
            .take_receiver()
            .ok_or_else(|| LinkingError::Cancelled("confirmation already awaited".into()))?;

        let mut guard = WaitGuard::enter(self);
        let result = receiver
            .await
            .unwrap_or_else(|_| Err(LinkingError::Cancelled("session dropped".into())));
        guard.armed = false;
        result
    }

    /// Cause recorded by the Failed state, or a generic cancellation.
    fn failure_cause(&self) -> LinkingError {
        match self.status() {
            LinkingState::Failed { cause: Some(cause) } => cause,
            _ => LinkingError::Cancelled("session ended before provisioning completed".into()),
        }
    }

    /// Run the full linking flow against `provisioner`.
    pub async fn run<P: LinkingProvisioner>(
        &self,
        provisioner: &P,
    ) -> Result<LinkedDeviceInfo, LinkingError> {
        let rph = match provisioner.establish_rendezvous().await {
            Ok(rph) => rph,
            Err(err) => {
                self.fail(err.clone());
                return Err(err);
            }
        };

        if let Some(code) = self.rendezvous_established(rph) {
            debug!("Waiting for operator to compare {}", code);
        }
        self.wait_for_confirmation().await?;

        match provisioner.exchange_provisioning().await {
            Ok(device) => {
                if !self.complete() {
                    let cause = self.failure_cause();
                    warn!("Provisioning finished after the session ended: {}", cause);
                    return Err(cause);
                }
                info!("Device linking completed");
                Ok(device)
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }
}

/// Held while a handle waits for confirmation.
struct WaitGuard<'a> {
    session: &'a DeviceLinkingSession,
    armed: bool,
}

impl<'a> WaitGuard<'a> {
    fn enter(session: &'a DeviceLinkingSession) -> Self {
        session.inner.operators.fetch_sub(1, Ordering::AcqRel);
        Self {
            session,
            armed: true,
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.cancel("confirmation await cancelled");
        }
        self.session.inner.operators.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rph(prefix: [u8; 3]) -> RendezvousPathHash {
        let mut bytes = [0x42u8; 32];
        bytes[..3].copy_from_slice(&prefix);
        RendezvousPathHash::from_bytes(bytes)
    }

    fn device() -> LinkedDeviceInfo {
        LinkedDeviceInfo {
            device_id: 9,
            device_label: "Desktop".into(),
            platform_hint: "Linux".into(),
            last_active_at: None,
        }
    }

    struct Provisioner {
        rendezvous: Result<[u8; 3], LinkingError>,
        provisioning: Result<LinkedDeviceInfo, LinkingError>,
        delay: Duration,
    }

    impl Provisioner {
        fn ok() -> Self {
            Self {
                rendezvous: Ok([0, 128, 255]),
                provisioning: Ok(device()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LinkingProvisioner for Provisioner {
        async fn establish_rendezvous(&self) -> Result<RendezvousPathHash, LinkingError> {
            self.rendezvous.clone().map(rph)
        }

        async fn exchange_provisioning(&self) -> Result<LinkedDeviceInfo, LinkingError> {
            tokio::time::sleep(self.delay).await;
            self.provisioning.clone()
        }
    }

    async fn wait_connected(session: &DeviceLinkingSession) {
        session
            .subscribe()
            .wait_for(|s| matches!(s, LinkingState::Connected { .. }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn established_path_exposes_short_code() {
        let session = DeviceLinkingSession::new();
        let code = session.rendezvous_established(rph([0, 128, 255]));

        assert_eq!(code, Some(ShortCode(0, 0, 127)));
        assert_eq!(session.short_code(), Some(ShortCode(0, 0, 127)));
    }

    #[tokio::test]
    async fn confirmation_resolves_exactly_once() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        assert!(session.confirm_rendezvous_path());
        assert!(!session.confirm_rendezvous_path());
        assert!(!session.decline_rendezvous_path());

        assert_eq!(session.wait_for_confirmation().await, Ok(()));
        assert_eq!(session.status(), LinkingState::Confirmed);
    }

    #[tokio::test]
    async fn confirmation_before_connected_is_ignored() {
        let session = DeviceLinkingSession::new();
        assert!(!session.confirm_rendezvous_path());
        assert_eq!(session.status(), LinkingState::Connecting);
    }

    #[tokio::test]
    async fn decline_fails_the_session() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        assert!(session.decline_rendezvous_path());
        let err = session.wait_for_confirmation().await.unwrap_err();

        assert!(err.is_declined());
        assert!(matches!(
            session.status(),
            LinkingState::Failed { cause: Some(c) } if c.is_declined()
        ));
        assert!(!session.complete());
    }

    #[tokio::test]
    async fn decline_without_waiter_is_terminal() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        assert!(session.decline_rendezvous_path());

        assert!(session.status().is_terminal());
        assert!(matches!(
            session.status(),
            LinkingState::Failed { cause: Some(c) } if c.is_declined()
        ));
        assert!(!session.confirm_rendezvous_path());
    }

    #[tokio::test]
    async fn second_wait_is_rejected() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));
        session.confirm_rendezvous_path();

        session.wait_for_confirmation().await.unwrap();
        assert!(matches!(
            session.wait_for_confirmation().await,
            Err(LinkingError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn run_completes_after_confirmation() {
        let session = DeviceLinkingSession::new();
        let operator = {
            let session = session.clone();
            tokio::spawn(async move {
                wait_connected(&session).await;
                assert_eq!(session.short_code(), Some(ShortCode(0, 0, 127)));
                session.confirm_rendezvous_path()
            })
        };

        let linked = session.run(&Provisioner::ok()).await.unwrap();

        assert!(operator.await.unwrap());
        assert_eq!(linked, device());
        assert_eq!(session.status(), LinkingState::Completed);
    }

    #[tokio::test]
    async fn run_never_completes_without_confirmation() {
        let session = DeviceLinkingSession::new();
        let operator = {
            let session = session.clone();
            tokio::spawn(async move {
                wait_connected(&session).await;
                session.decline_rendezvous_path()
            })
        };

        let err = session.run(&Provisioner::ok()).await.unwrap_err();

        assert!(operator.await.unwrap());
        assert!(err.is_declined());
        assert!(!matches!(session.status(), LinkingState::Completed));
    }

    #[tokio::test]
    async fn cancel_during_provisioning_fails_run() {
        let session = DeviceLinkingSession::new();
        let provisioner = Provisioner {
            delay: Duration::from_millis(100),
            ..Provisioner::ok()
        };
        let operator = {
            let session = session.clone();
            tokio::spawn(async move {
                wait_connected(&session).await;
                assert!(session.confirm_rendezvous_path());
                tokio::time::sleep(Duration::from_millis(20)).await;
                session.cancel("operator closed dialog");
            })
        };

        let err = session.run(&provisioner).await.unwrap_err();
        operator.await.unwrap();

        assert_eq!(err, LinkingError::Cancelled("operator closed dialog".into()));
        assert_eq!(
            session.status(),
            LinkingState::Failed {
                cause: Some(LinkingError::Cancelled("operator closed dialog".into()))
            }
        );
    }

    #[tokio::test]
    async fn transport_error_fails_session() {
        let session = DeviceLinkingSession::new();
        let provisioner = Provisioner {
            rendezvous: Err(LinkingError::Transport("relay unreachable".into())),
            ..Provisioner::ok()
        };

        let err = session.run(&provisioner).await.unwrap_err();

        assert_eq!(err, LinkingError::Transport("relay unreachable".into()));
        assert_eq!(
            session.status(),
            LinkingState::Failed {
                cause: Some(LinkingError::Transport("relay unreachable".into()))
            }
        );
    }

    #[tokio::test]
    async fn provisioning_failure_after_confirmation() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));
        session.confirm_rendezvous_path();
        session.wait_for_confirmation().await.unwrap();

        session.fail(LinkingError::Provisioning("peer closed".into()));

        assert!(matches!(session.status(), LinkingState::Failed { .. }));
        assert!(!session.complete());
    }

    #[tokio::test]
    async fn cancel_resolves_pending_waiter() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_confirmation().await })
        };
        tokio::task::yield_now().await;
        session.cancel("user closed dialog");

        assert_eq!(
            waiter.await.unwrap(),
            Err(LinkingError::Cancelled("user closed dialog".into()))
        );
        assert!(!session.confirm_rendezvous_path());
    }

    #[tokio::test]
    async fn timed_out_await_cancels_session() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        let result =
            tokio::time::timeout(Duration::from_millis(20), session.wait_for_confirmation()).await;

        assert!(result.is_err());
        assert!(matches!(
            session.status(),
            LinkingState::Failed {
                cause: Some(LinkingError::Cancelled(_))
            }
        ));
        assert!(!session.confirm_rendezvous_path());
    }

    #[tokio::test]
    async fn dropping_session_resolves_waiter() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));
        let status = session.subscribe();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_confirmation().await })
        };
        tokio::task::yield_now().await;
        drop(session);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve once the session is dropped")
            .unwrap();
        assert_eq!(result, Err(LinkingError::Cancelled("session dropped".into())));
        assert!(status.borrow().is_terminal());
    }

    #[tokio::test]
    async fn dropping_a_handle_after_confirmation_keeps_the_session() {
        let session = DeviceLinkingSession::new();
        session.rendezvous_established(rph([1, 2, 3]));

        let operator = session.clone();
        assert!(operator.confirm_rendezvous_path());
        drop(operator);

        assert_eq!(session.wait_for_confirmation().await, Ok(()));
        assert_eq!(session.status(), LinkingState::Confirmed);
    }
}
