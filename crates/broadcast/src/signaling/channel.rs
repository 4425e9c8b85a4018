//! One bidirectional relay connection under one identity
//!
//! The channel owns its relay link for its whole lifetime. A dispatcher task
//! reads relay frames and either routes them to the call they belong to (in
//! arrival order) or emits them on the channel event stream.

use super::protocol::SignalMessage;
use super::relay::{Envelope, Relay, RelayFrame};
use crate::call::CallId;
use crate::config::BroadcastConfig;
use crate::error::{CallFailure, FailureKind};
use crate::identity::PeerIdentity;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Lifecycle of a signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected
    Closed,
    /// Connecting and registering
    Opening,
    /// Registered and exchanging messages
    Open,
    /// Relay connection lost
    Failed,
}

/// Offer from a remote peer that opens a new call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    /// Caller relay id
    pub from: String,
    /// Call the caller opened
    pub call_id: CallId,
    /// Offer payload
    pub offer: String,
}

/// Inbound event not claimed by a registered call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A remote peer wants to open a call
    IncomingCallRequest(IncomingCall),
    /// Answer for a call that is not registered here
    RemoteAnswer {
        /// Call id
        call_id: CallId,
        /// Answer payload
        answer: String,
    },
    /// Rejection for a call that is not registered here
    RemoteRejected {
        /// Call id
        call_id: CallId,
        /// Reason given by the remote
        reason: String,
    },
    /// Hangup for a call that is not registered here
    RemoteClosed {
        /// Call id
        call_id: CallId,
    },
    /// The channel itself failed
    ChannelError(FailureKind),
}

/// Call-scoped signal delivered to the call's driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallSignal {
    Answer(String),
    Rejected(CallFailure),
    RemoteClosed,
}

struct CallRoute {
    peer: String,
    tx: mpsc::UnboundedSender<CallSignal>,
}

struct ChannelShared {
    identity: PeerIdentity,
    relay_id: String,
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    routes: Mutex<HashMap<CallId, CallRoute>>,
    closed: AtomicBool,
}

impl ChannelShared {
    fn route_to(&self, call_id: &CallId, from: &str, signal: CallSignal) -> Option<CallSignal> {
        let routes = self.routes.lock();
        match routes.get(call_id) {
            Some(route) if route.peer == from => {
                // A driver that already finished is equivalent to no route.
                let _ = route.tx.send(signal);
                None
            }
            Some(route) => {
                warn!(
                    "Dropping {:?} for call {} from {} (call belongs to {})",
                    signal, call_id, from, route.peer
                );
                None
            }
            None => Some(signal),
        }
    }

    fn signal_peer_calls(&self, peer: &str, signal: CallSignal) -> usize {
        let routes = self.routes.lock();
        let mut count = 0;
        for route in routes.values().filter(|r| r.peer == peer) {
            let _ = route.tx.send(signal.clone());
            count += 1;
        }
        count
    }
}

/// Relay connection registered under one identity
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
    events: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connect to the relay and register `identity`
    ///
    /// Bounded by `config.relay_connect_timeout()`.
    ///
    /// # Errors
    ///
    /// - `Error::IdentityAlreadyRegistered` if the identity is held elsewhere
    /// - `Error::RelayUnreachable` on connect failure or timeout
    pub async fn open(
        relay: &dyn Relay,
        identity: PeerIdentity,
        config: &BroadcastConfig,
    ) -> Result<Self> {
        let relay_id = identity.relay_id();
        let (state, _) = watch::channel(ChannelState::Opening);

        debug!("Opening signaling channel {} via {} relay", relay_id, relay.name());

        let link = match tokio::time::timeout(
            config.relay_connect_timeout(),
            relay.register(&relay_id),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Failed to open signaling channel {}: {}", relay_id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Timed out opening signaling channel {}", relay_id);
                return Err(Error::RelayUnreachable(format!(
                    "no registration within {:?}",
                    config.relay_connect_timeout()
                )));
            }
        };

        let shared = Arc::new(ChannelShared {
            identity,
            relay_id: relay_id.clone(),
            state,
            outbound: Mutex::new(Some(link.outbound)),
            routes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), link.inbound, events_tx));

        shared.state.send_replace(ChannelState::Open);
        info!("Signaling channel {} open", relay_id);

        Ok(Self {
            shared,
            events: Mutex::new(Some(events_rx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Identity registered by this channel
    pub fn identity(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    /// Relay id registered by this channel
    pub fn relay_id(&self) -> &str {
        &self.shared.relay_id
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Take the inbound event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<ReceiverStream<ChannelEvent>> {
        self.events.lock().take().map(ReceiverStream::new)
    }

    /// Send a signal to another identity
    pub fn send(&self, to: &str, message: SignalMessage) -> Result<()> {
        let outbound = self.shared.outbound.lock();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed(self.shared.relay_id.clone()))?;

        debug!("{} -> {}: {} {}", self.shared.relay_id, to, message.kind(), message.call_id());
        sender
            .send(Envelope {
                to: to.to_string(),
                message,
            })
            .map_err(|_| Error::RelayUnreachable("relay link closed".to_string()))
    }

    /// Claim every future signal for `call_id` from `peer`
    pub(crate) fn register_call(
        &self,
        call_id: &CallId,
        peer: &str,
    ) -> Result<mpsc::UnboundedReceiver<CallSignal>> {
        if self.state() != ChannelState::Open {
            return Err(Error::ChannelClosed(self.shared.relay_id.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.shared.routes.lock();
        if routes.contains_key(call_id) {
            return Err(Error::ProtocolViolation(format!("duplicate call id {}", call_id)));
        }
        routes.insert(
            call_id.clone(),
            CallRoute {
                peer: peer.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Release the route of a finished call
    pub(crate) fn unregister_call(&self, call_id: &CallId) {
        self.shared.routes.lock().remove(call_id);
    }

    /// Number of calls currently routed through this channel
    pub fn active_calls(&self) -> usize {
        self.shared.routes.lock().len()
    }

    /// Release the relay connection. Idempotent from any state.
    ///
    /// Every routed call observes the end of its route.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Failed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });

        self.shared.outbound.lock().take();
        self.shared.routes.lock().clear();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }

        info!("Signaling channel {} closed", self.shared.relay_id);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("relay_id", &self.shared.relay_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn dispatch_loop(
    shared: Arc<ChannelShared>,
    mut inbound: mpsc::UnboundedReceiver<RelayFrame>,
    events: mpsc::Sender<ChannelEvent>,
) {
    while let Some(frame) = inbound.recv().await {
        let event = match frame {
            RelayFrame::Message { from, message } => dispatch_message(&shared, from, message),
            RelayFrame::PeerGone { peer } => {
                let affected = shared.signal_peer_calls(&peer, CallSignal::RemoteClosed);
                debug!("{} left; closing {} call(s)", peer, affected);
                None
            }
            RelayFrame::Undeliverable { to } => {
                let affected = shared
                    .signal_peer_calls(&to, CallSignal::Rejected(CallFailure::PeerUnavailable));
                debug!("{} is not registered; {} call(s) rejected", to, affected);
                None
            }
            RelayFrame::Malformed { detail } => {
                warn!("Relay reported malformed traffic on {}: {}", shared.relay_id, detail);
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("Channel {} event stream dropped", shared.relay_id);
            }
        }
    }

    if shared.closed.load(Ordering::SeqCst) {
        return;
    }

    warn!("Relay connection for {} lost", shared.relay_id);
    shared.state.send_replace(ChannelState::Failed);
    shared.outbound.lock().take();
    shared.routes.lock().clear();
    let _ = events
        .send(ChannelEvent::ChannelError(FailureKind::RelayUnreachable))
        .await;
}

fn dispatch_message(
    shared: &ChannelShared,
    from: String,
    message: SignalMessage,
) -> Option<ChannelEvent> {
    match message {
        SignalMessage::Offer { call_id, sdp } => {
            if shared.routes.lock().contains_key(&call_id) {
                warn!("Ignoring offer for already active call {} from {}", call_id, from);
                return None;
            }
            Some(ChannelEvent::IncomingCallRequest(IncomingCall {
                from,
                call_id,
                offer: sdp,
            }))
        }
        SignalMessage::Answer { call_id, sdp } => shared
            .route_to(&call_id, &from, CallSignal::Answer(sdp))
            .and_then(|signal| match signal {
                CallSignal::Answer(answer) => Some(ChannelEvent::RemoteAnswer { call_id, answer }),
                _ => None,
            }),
        SignalMessage::Reject { call_id, reason } => shared
            .route_to(
                &call_id,
                &from,
                CallSignal::Rejected(CallFailure::Rejected(reason.clone())),
            )
            .map(|_| ChannelEvent::RemoteRejected { call_id, reason }),
        SignalMessage::Hangup { call_id } => shared
            .route_to(&call_id, &from, CallSignal::RemoteClosed)
            .map(|_| ChannelEvent::RemoteClosed { call_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{broadcaster_identity, new_viewer_identity, EventId};
    use crate::signaling::LocalRelay;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn config() -> BroadcastConfig {
        BroadcastConfig {
            relay_connect_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn event() -> EventId {
        EventId::new("evt-channel").unwrap()
    }

    #[tokio::test]
    async fn test_open_and_duplicate_identity() {
        let relay = LocalRelay::new();
        let first = SignalingChannel::open(&relay, broadcaster_identity(&event()), &config())
            .await
            .unwrap();
        assert_eq!(first.state(), ChannelState::Open);

        let err = SignalingChannel::open(&relay, broadcaster_identity(&event()), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_identity() {
        let relay = LocalRelay::new();
        let identity = broadcaster_identity(&event());
        let channel = SignalingChannel::open(&relay, identity.clone(), &config())
            .await
            .unwrap();

        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.send("anyone", SignalMessage::Hangup { call_id: CallId::new() }).is_err());

        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.is_registered(&identity.relay_id()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_identity() {
        let relay = LocalRelay::new();
        let identity = broadcaster_identity(&event());
        {
            let _channel = SignalingChannel::open(&relay, identity.clone(), &config())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if SignalingChannel::open(&relay, identity.clone(), &config()).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_offer_becomes_incoming_call() {
        let relay = LocalRelay::new();
        let broadcaster =
            SignalingChannel::open(&relay, broadcaster_identity(&event()), &config())
                .await
                .unwrap();
        let viewer =
            SignalingChannel::open(&relay, new_viewer_identity(&event()).unwrap(), &config())
                .await
                .unwrap();

        let mut events = broadcaster.events().unwrap();
        assert!(broadcaster.events().is_none());

        let call_id = CallId::new();
        viewer
            .send(
                broadcaster.relay_id(),
                SignalMessage::Offer { call_id: call_id.clone(), sdp: "offer".into() },
            )
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ChannelEvent::IncomingCallRequest(IncomingCall {
                from: viewer.relay_id().to_string(),
                call_id,
                offer: "offer".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_routed_signals_keep_order() {
        let relay = LocalRelay::new();
        let broadcaster =
            SignalingChannel::open(&relay, broadcaster_identity(&event()), &config())
                .await
                .unwrap();
        let viewer =
            SignalingChannel::open(&relay, new_viewer_identity(&event()).unwrap(), &config())
                .await
                .unwrap();

        let call_id = CallId::new();
        let mut route = viewer.register_call(&call_id, broadcaster.relay_id()).unwrap();

        broadcaster
            .send(viewer.relay_id(), SignalMessage::Answer { call_id: call_id.clone(), sdp: "a".into() })
            .unwrap();
        broadcaster
            .send(viewer.relay_id(), SignalMessage::Hangup { call_id: call_id.clone() })
            .unwrap();

        assert_eq!(route.recv().await.unwrap(), CallSignal::Answer("a".into()));
        assert_eq!(route.recv().await.unwrap(), CallSignal::RemoteClosed);
    }

    #[tokio::test]
    async fn test_undeliverable_rejects_routed_call() {
        let relay = LocalRelay::new();
        let viewer =
            SignalingChannel::open(&relay, new_viewer_identity(&event()).unwrap(), &config())
                .await
                .unwrap();
        let target = broadcaster_identity(&event()).relay_id();

        let call_id = CallId::new();
        let mut route = viewer.register_call(&call_id, &target).unwrap();
        viewer
            .send(&target, SignalMessage::Offer { call_id, sdp: "offer".into() })
            .unwrap();

        assert_eq!(
            route.recv().await.unwrap(),
            CallSignal::Rejected(CallFailure::PeerUnavailable)
        );
    }

    #[tokio::test]
    async fn test_relay_loss_fails_channel() {
        let relay = LocalRelay::new();
        let viewer =
            SignalingChannel::open(&relay, new_viewer_identity(&event()).unwrap(), &config())
                .await
                .unwrap();
        let mut events = viewer.events().unwrap();
        let mut route = viewer.register_call(&CallId::new(), "bc-x").unwrap();

        relay.disconnect(viewer.relay_id());

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ChannelEvent::ChannelError(FailureKind::RelayUnreachable));
        assert_eq!(viewer.state(), ChannelState::Failed);
        assert!(route.recv().await.is_none());

        viewer.close();
        assert_eq!(viewer.state(), ChannelState::Failed);
    }
}
