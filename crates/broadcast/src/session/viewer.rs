//! Watching side of a broadcast
//!
//! A viewer registers a fresh identity, calls the event's broadcaster and
//! keeps at most one call. Every attempt runs under a generation number;
//! `stop` and `retry` bump it so late updates from an older attempt are
//! discarded.

use super::SessionError;
use crate::call::{CallState, MediaCall, MediaCallNegotiator, ViewerCall};
use crate::config::BroadcastConfig;
use crate::error::{CallFailure, FailureKind};
use crate::identity::{broadcaster_identity, new_viewer_identity, EventId, PeerIdentity};
use crate::media::{MediaTransport, RemoteStream};
use crate::signaling::channel::{ChannelEvent, SignalingChannel};
use crate::signaling::protocol::SignalMessage;
use crate::signaling::relay::Relay;
use crate::supervisor::{supervise_viewer, SessionHealth, Supervised, SupervisorHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

/// Viewer lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerState {
    /// Not started, or stopped
    Idle,
    /// Registering and calling the broadcaster
    Connecting,
    /// Receiving the broadcast
    Connected,
    /// Broadcast not reachable right now
    Offline {
        /// Why the last call ended, `None` for a clean hangup
        reason: Option<CallFailure>,
    },
    /// Relay or protocol failure
    Error(SessionError),
}

impl ViewerState {
    fn health(&self) -> SessionHealth {
        match self {
            ViewerState::Idle => SessionHealth::Idle,
            ViewerState::Connecting => SessionHealth::Pending,
            ViewerState::Connected => SessionHealth::Healthy,
            ViewerState::Offline { reason } => SessionHealth::Failed(
                reason
                    .as_ref()
                    .map(CallFailure::kind)
                    .unwrap_or(FailureKind::PeerUnavailable),
            ),
            ViewerState::Error(error) => SessionHealth::Failed(error.kind),
        }
    }

    /// Collapse to what a viewer page shows
    pub fn outcome(&self) -> ViewerOutcome {
        match self {
            ViewerState::Connecting => ViewerOutcome::Connecting,
            ViewerState::Connected => ViewerOutcome::Live,
            ViewerState::Idle | ViewerState::Offline { .. } | ViewerState::Error(_) => {
                ViewerOutcome::NotAvailable
            }
        }
    }
}

/// Coarse viewer outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerOutcome {
    /// Still trying
    Connecting,
    /// Broadcast is playing
    Live,
    /// Broadcast offline or unreachable
    NotAvailable,
}

/// Map a settled, non-connected call to the viewer state it implies
fn state_for_ended_call(state: &CallState) -> ViewerState {
    match state {
        CallState::Failed(reason) if reason.is_peer_absent() => ViewerState::Offline {
            reason: Some(reason.clone()),
        },
        CallState::Failed(reason) => {
            ViewerState::Error(SessionError::new(reason.kind(), reason.to_string()))
        }
        _ => ViewerState::Offline { reason: None },
    }
}

struct ActiveViewing {
    generation: u64,
    identity: PeerIdentity,
    channel: Arc<SignalingChannel>,
    call: ViewerCall,
    monitor: Option<JoinHandle<()>>,
}

impl ActiveViewing {
    async fn release(mut self, abort_monitor: bool) {
        if let Some(monitor) = self.monitor.take() {
            if abort_monitor {
                monitor.abort();
            }
        }
        self.call.close().await;
        self.channel.close();
        debug!("Released viewing as {}", self.identity);
    }
}

struct ViewerInner {
    relay: Arc<dyn Relay>,
    negotiator: MediaCallNegotiator,
    config: BroadcastConfig,
    state: watch::Sender<ViewerState>,
    health: watch::Sender<SessionHealth>,
    generation: watch::Sender<u64>,
    event_id: Mutex<Option<EventId>>,
    active: Mutex<Option<ActiveViewing>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ViewerInner {
    fn next_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    /// Publish `next` if `generation` is still current
    fn publish(&self, generation: u64, next: ViewerState) -> bool {
        self.state.send_if_modified(|state| {
            if *self.generation.borrow() != generation {
                return false;
            }
            debug!("Viewer state {:?} -> {:?}", state, next);
            self.health.send_replace(next.health());
            *state = next;
            true
        })
    }

    async fn teardown_current(&self) {
        let current = self.active.lock().take();
        if let Some(active) = current {
            active.release(true).await;
        }
    }

    /// Release the viewing from its own monitor, if it is still current
    async fn release_if_current(&self, generation: u64) {
        let current = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(a) if a.generation == generation => active.take(),
                _ => None,
            }
        };
        if let Some(active) = current {
            active.release(false).await;
        }
    }
}

/// Watching-side session
#[derive(Clone)]
pub struct ViewerSession {
    inner: Arc<ViewerInner>,
}

impl ViewerSession {
    /// Create an idle viewer
    pub fn new(
        relay: Arc<dyn Relay>,
        transport: Arc<dyn MediaTransport>,
        config: BroadcastConfig,
    ) -> Self {
        let (state, _) = watch::channel(ViewerState::Idle);
        let (health, _) = watch::channel(SessionHealth::Idle);
        let (generation, _) = watch::channel(0);

        Self {
            inner: Arc::new(ViewerInner {
                relay,
                negotiator: MediaCallNegotiator::new(transport, &config),
                config,
                state,
                health,
                generation,
                event_id: Mutex::new(None),
                active: Mutex::new(None),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect to the broadcast of `event_id`
    ///
    /// Returns the settled state: `Connected`, `Offline` or `Error`. A
    /// previous viewing is torn down first.
    ///
    /// # Errors
    ///
    /// - `Error::EntropyUnavailable` if no viewer identity can be generated
    /// - `Error::Cancelled` if `stop` ran while connecting
    #[instrument(skip(self, event_id), fields(event = %event_id))]
    pub async fn start(&self, event_id: EventId) -> Result<ViewerState> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.teardown_current().await;

        let generation = self.inner.next_generation();
        *self.inner.event_id.lock() = Some(event_id.clone());
        self.inner.publish(generation, ViewerState::Connecting);

        let mut cancelled = self.inner.generation.subscribe();
        let result = tokio::select! {
            result = connect(&self.inner, &event_id, generation) => result,
            _ = cancelled.wait_for(|g| *g != generation) => {
                Err(Error::Cancelled("viewer stopped while connecting".to_string()))
            }
        };

        match result {
            Ok(state) => Ok(state),
            Err(Error::Cancelled(detail)) => {
                debug!("Viewer attempt cancelled: {}", detail);
                Err(Error::Cancelled(detail))
            }
            Err(e) => {
                warn!("Viewer failed to connect: {}", e);
                let state = ViewerState::Error(SessionError::from(&e));
                self.inner.publish(generation, state.clone());
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(state)
                }
            }
        }
    }

    /// Tear down the current attempt and connect again under a new identity
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if the viewer was never started, otherwise as
    /// for `start`.
    pub async fn retry(&self) -> Result<ViewerState> {
        let event_id = self
            .inner
            .event_id
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("retry before start".to_string()))?;
        self.start(event_id).await
    }

    /// Release channel and call, ending in `Idle`. Idempotent.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.next_generation();
        let _op = self.inner.op_lock.lock().await;
        self.inner.teardown_current().await;

        self.inner.state.send_if_modified(|state| {
            if *state == ViewerState::Idle {
                false
            } else {
                *state = ViewerState::Idle;
                true
            }
        });
        self.inner.health.send_replace(SessionHealth::Idle);
    }

    /// Current state
    pub fn state(&self) -> ViewerState {
        self.inner.state.borrow().clone()
    }

    /// Current state collapsed to `Connecting`, `Live` or `NotAvailable`
    pub fn outcome(&self) -> ViewerOutcome {
        self.inner.state.borrow().outcome()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ViewerState> {
        self.inner.state.subscribe()
    }

    /// Broadcast stream while connected
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner
            .active
            .lock()
            .as_ref()
            .and_then(|active| active.call.remote_stream())
    }

    /// Identity of the current viewing
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.identity.clone())
    }

    /// Configuration this viewer was built with
    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Retry this viewer in the background with `config().reconnect`
    pub fn supervise(&self) -> SupervisorHandle {
        supervise_viewer(self.clone(), self.inner.config.reconnect.clone())
    }
}

#[async_trait]
impl Supervised for ViewerSession {
    async fn retry(&self) -> Result<()> {
        ViewerSession::retry(self).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        ViewerSession::stop(self).await;
        Ok(())
    }

    fn health(&self) -> watch::Receiver<SessionHealth> {
        self.inner.health.subscribe()
    }
}

async fn connect(
    inner: &Arc<ViewerInner>,
    event_id: &EventId,
    generation: u64,
) -> Result<ViewerState> {
    let identity = new_viewer_identity(event_id)?;
    let channel = Arc::new(
        SignalingChannel::open(inner.relay.as_ref(), identity.clone(), &inner.config).await?,
    );
    let events = channel.events();

    let target = broadcaster_identity(event_id);
    let call = ViewerCall::new(inner.negotiator.place_call(&channel, &target, None).await?);

    let settled = call.handle().settled().await;
    if settled != CallState::Connected {
        info!("Broadcast {} not available: {}", event_id, settled);
        call.close().await;
        channel.close();
        let state = state_for_ended_call(&settled);
        inner.publish(generation, state.clone());
        return Ok(state);
    }

    if !inner.publish(generation, ViewerState::Connected) {
        call.close().await;
        channel.close();
        return Err(Error::Cancelled("viewer stopped while connecting".to_string()));
    }

    let monitor = tokio::spawn(monitor_viewing(
        Arc::downgrade(inner),
        generation,
        call.clone(),
        Arc::downgrade(&channel),
        events,
    ));
    *inner.active.lock() = Some(ActiveViewing {
        generation,
        identity,
        channel,
        call,
        monitor: Some(monitor),
    });

    info!("Watching broadcast {}", event_id);
    Ok(ViewerState::Connected)
}

async fn next_event(events: &mut Option<ReceiverStream<ChannelEvent>>) -> Option<ChannelEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Follow a connected call until it ends or the channel fails
async fn monitor_viewing(
    inner: Weak<ViewerInner>,
    generation: u64,
    call: ViewerCall,
    channel: Weak<SignalingChannel>,
    mut events: Option<ReceiverStream<ChannelEvent>>,
) {
    let mut events_done = events.is_none();

    let next_state = loop {
        tokio::select! {
            ended = call.handle().terminated() => break state_for_ended_call(&ended),
            event = next_event(&mut events), if !events_done => match event {
                Some(ChannelEvent::ChannelError(kind)) => {
                    break ViewerState::Error(SessionError::new(kind, "relay connection lost"));
                }
                Some(ChannelEvent::IncomingCallRequest(request)) => {
                    debug!("Viewer rejecting unexpected call from {}", request.from);
                    if let Some(channel) = channel.upgrade() {
                        let reject = SignalMessage::Reject {
                            call_id: request.call_id,
                            reason: "viewers do not accept calls".to_string(),
                        };
                        let _ = channel.send(&request.from, reject);
                    }
                }
                Some(other) => debug!("Viewer ignoring {:?}", other),
                None => events_done = true,
            },
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    info!("Viewing ended: {:?}", next_state);
    if inner.publish(generation, next_state) {
        inner.release_if_current(generation).await;
    }
}
