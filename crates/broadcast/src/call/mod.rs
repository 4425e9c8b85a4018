//! Media calls and their negotiation
//!
//! A call is one peer-to-peer media link negotiated over a
//! `SignalingChannel`. `MediaCallNegotiator` sends the offer (or answer),
//! then hands the call to a driver task that consumes the call's signals and
//! transport state in order until the call connects or ends.
//!
//! The two ends wrap the shared `CallHandle` differently: `ViewerCall` exposes
//! the received stream, `BroadcasterCallEntry` tracks one viewer in the
//! fan-out map. Both implement `MediaCall`.

mod negotiator;

pub use negotiator::MediaCallNegotiator;

use crate::error::CallFailure;
use crate::identity::PeerRole;
use crate::media::{MediaSource, RemoteStream, TransportLink};
use crate::signaling::channel::SignalingChannel;
use crate::signaling::protocol::SignalMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Unique id of one call (UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh call id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Created, nothing sent
    Idle,
    /// Offer sent, awaiting answer
    Offering,
    /// Offer received, producing the answer
    Answering,
    /// Answer exchanged, awaiting a live media path
    Negotiating,
    /// Media path live
    Connected,
    /// Local close in progress
    Closing,
    /// Ended cleanly
    Closed,
    /// Ended with a failure
    Failed(CallFailure),
}

impl CallState {
    /// `Closed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed(_))
    }

    /// `Connected` or terminal
    pub fn is_settled(&self) -> bool {
        *self == CallState::Connected || self.is_terminal()
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Offering => write!(f, "offering"),
            CallState::Answering => write!(f, "answering"),
            CallState::Negotiating => write!(f, "negotiating"),
            CallState::Connected => write!(f, "connected"),
            CallState::Closing => write!(f, "closing"),
            CallState::Closed => write!(f, "closed"),
            CallState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

pub(crate) struct CallInner {
    call_id: CallId,
    local_role: PeerRole,
    remote: String,
    state: watch::Sender<CallState>,
    link: Arc<dyn TransportLink>,
    channel: Weak<SignalingChannel>,
    source: Option<MediaSource>,
    driver: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
    closing: AtomicBool,
}

impl CallInner {
    /// Move to `next` unless the call already ended
    pub(crate) fn transition(&self, next: CallState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next.clone();
                true
            }
        });
        if changed {
            debug!("Call {} with {} -> {}", self.call_id, self.remote, next);
        }
        changed
    }

    pub(crate) fn current(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Release route, link and source. Runs once.
    pub(crate) async fn release(&self, notify_remote: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(channel) = self.channel.upgrade() {
            if notify_remote {
                let hangup = SignalMessage::Hangup {
                    call_id: self.call_id.clone(),
                };
                if let Err(e) = channel.send(&self.remote, hangup) {
                    debug!("Could not send hangup for call {}: {}", self.call_id, e);
                }
            }
            channel.unregister_call(&self.call_id);
        }

        if let Err(e) = self.link.close().await {
            warn!("Failed to close transport for call {}: {}", self.call_id, e);
        }
    }

    /// End the call from the driver
    pub(crate) async fn finish(&self, outcome: CallState, notify_remote: bool) {
        self.transition(outcome);
        self.release(notify_remote).await;
    }
}

/// Shared handle to one call
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<CallInner>,
}

impl CallHandle {
    pub(crate) fn from_inner(inner: Arc<CallInner>) -> Self {
        Self { inner }
    }

    /// Call id
    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// Local role on this call
    pub fn local_role(&self) -> PeerRole {
        self.inner.local_role
    }

    /// Remote relay id
    pub fn remote_identity(&self) -> &str {
        &self.inner.remote
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.inner.current()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    /// Local media attached to this call, if any
    pub fn attached_source(&self) -> Option<&MediaSource> {
        self.inner.source.as_ref()
    }

    /// Received media, once connected
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        if self.state() == CallState::Connected {
            self.inner.link.remote_stream()
        } else {
            None
        }
    }

    /// Wait until the call is `Connected`, `Closed` or `Failed`
    pub async fn settled(&self) -> CallState {
        self.wait_for(CallState::is_settled).await
    }

    /// Wait until the call is `Closed` or `Failed`
    pub async fn terminated(&self) -> CallState {
        self.wait_for(CallState::is_terminal).await
    }

    /// Wait for the call to settle; anything but `Connected` is an error
    ///
    /// # Errors
    ///
    /// The call's `CallFailure` converted to `Error`, or `Error::Cancelled`
    /// when the call was closed before connecting.
    pub async fn connected(&self) -> Result<()> {
        match self.settled().await {
            CallState::Connected => Ok(()),
            CallState::Failed(reason) => Err(reason.into()),
            other => Err(Error::Cancelled(format!("call ended as {}", other))),
        }
    }

    async fn wait_for(&self, predicate: impl Fn(&CallState) -> bool) -> CallState {
        let mut rx = self.inner.state.subscribe();
        let settled = match rx.wait_for(|s| predicate(s)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }

    /// Close the call. Idempotent; a call that already ended keeps its state.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }

        let was_terminal = self.inner.current().is_terminal();
        self.inner.transition(CallState::Closing);
        self.inner.release(!was_terminal).await;
        self.inner.state.send_if_modified(|state| {
            if *state == CallState::Closing {
                *state = CallState::Closed;
                true
            } else {
                false
            }
        });
        debug!("Call {} closed locally", self.inner.call_id);
    }

    pub(crate) fn set_driver(&self, driver: JoinHandle<()>) {
        let mut slot = self.inner.driver.lock();
        if self.inner.closing.load(Ordering::SeqCst) {
            driver.abort();
        } else {
            *slot = Some(driver);
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.inner.call_id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Capability shared by both call variants
#[async_trait]
pub trait MediaCall: Send + Sync {
    /// Underlying handle
    fn handle(&self) -> &CallHandle;

    /// Call id
    fn call_id(&self) -> &CallId {
        self.handle().call_id()
    }

    /// Remote relay id
    fn remote_identity(&self) -> &str {
        self.handle().remote_identity()
    }

    /// Current state
    fn state(&self) -> CallState {
        self.handle().state()
    }

    /// Close the call (idempotent)
    async fn close(&self) {
        self.handle().close().await
    }
}

/// Viewer side of a call: receives the broadcast
#[derive(Debug, Clone)]
pub struct ViewerCall {
    handle: CallHandle,
}

impl ViewerCall {
    /// Wrap a handle placed by a viewer
    pub fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    /// Broadcast stream, available once connected
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.handle.remote_stream()
    }
}

impl MediaCall for ViewerCall {
    fn handle(&self) -> &CallHandle {
        &self.handle
    }
}

/// Broadcaster side of a call: one viewer in the fan-out map
#[derive(Debug, Clone)]
pub struct BroadcasterCallEntry {
    handle: CallHandle,
    connected_at: Instant,
}

impl BroadcasterCallEntry {
    /// Wrap a connected inbound call
    pub fn new(handle: CallHandle) -> Self {
        Self {
            handle,
            connected_at: Instant::now(),
        }
    }

    /// Time since the viewer connected
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl MediaCall for BroadcasterCallEntry {
    fn handle(&self) -> &CallHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_unique_uuids() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_call_id_serializes_as_string() {
        let id = CallId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_state_classification() {
        assert!(CallState::Closed.is_terminal());
        assert!(CallState::Failed(CallFailure::TransportLost).is_terminal());
        assert!(!CallState::Connected.is_terminal());
        assert!(CallState::Connected.is_settled());
        assert!(!CallState::Negotiating.is_settled());
    }
}
