//! Mock transport for testing.
//!
//! Allows queueing reflected frames and capturing sent frames for verification.

use super::{CloseReason, Transport, TransportError};
use async_trait::async_trait;
use mdsync_types::OutgoingFrame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Mock transport for testing.
///
/// Starts connected. `recv()` drains the queued frames and then reports
/// `ConnectionClosed`, recording a normal close reason unless one was set.
/// Sends keep working until `close()` or `close_with()`.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    disconnected: bool,
    sent_frames: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    send_delays: VecDeque<Duration>,
    failing_sends: usize,
    fail_next_recv: Option<String>,
    close_reason: Option<CloseReason>,
}

impl MockTransport {
    /// Create a new connected mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame to be returned by a later `recv()` call.
    pub fn queue_frame(&self, data: Vec<u8>) {
        self.lock().receive_queue.push_back(data);
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    /// Get all sent frames that decode as [`OutgoingFrame`].
    pub fn sent_outgoing(&self) -> Vec<OutgoingFrame> {
        self.lock()
            .sent_frames
            .iter()
            .filter_map(|bytes| OutgoingFrame::from_bytes(bytes).ok())
            .collect()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent_frames.last().cloned()
    }

    /// Cause the next `count` sends to fail.
    pub fn fail_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// Delay upcoming sends, one duration per send.
    pub fn delay_sends(&self, delays: impl IntoIterator<Item = Duration>) {
        self.lock().send_delays.extend(delays);
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
    }

    /// Mark the connection closed by the server with the given reason.
    pub fn close_with(&self, reason: CloseReason) {
        let mut inner = self.lock();
        inner.disconnected = true;
        inner.close_reason = Some(reason);
    }

    /// Clear all state (frames, queue, connection).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let delay = self.lock().send_delays.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();

        if inner.disconnected {
            return Err(TransportError::NotConnected);
        }

        if inner.failing_sends > 0 {
            inner.failing_sends -= 1;
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        inner.sent_frames.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_recv.take() {
            return Err(TransportError::ReceiveFailed(error));
        }

        if let Some(frame) = inner.receive_queue.pop_front() {
            return Ok(frame);
        }

        if inner.close_reason.is_none() {
            inner.close_reason = Some(CloseReason::normal());
        }
        Err(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.disconnected = true;
        if inner.close_reason.is_none() {
            inner.close_reason = Some(CloseReason::normal());
        }
        Ok(())
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason.clone()
    }
}
