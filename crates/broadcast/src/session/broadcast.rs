//! Publishing side of a broadcast
//!
//! The broadcaster registers the event's well-known identity and accepts
//! every inbound call with the shared local source. Connected calls live in
//! a map keyed by the caller's relay id; a new call from the same identity
//! replaces the old entry, which is closed after the swap.

use super::SessionError;
use crate::call::{BroadcasterCallEntry, CallId, MediaCall, MediaCallNegotiator};
use crate::config::BroadcastConfig;
use crate::error::FailureKind;
use crate::identity::{broadcaster_identity, EventId, PeerIdentity};
use crate::media::{MediaSource, MediaTransport};
use crate::signaling::channel::{ChannelEvent, IncomingCall, SignalingChannel};
use crate::signaling::protocol::SignalMessage;
use crate::signaling::relay::Relay;
use crate::supervisor::{supervise_broadcast, SessionHealth, Supervised, SupervisorHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

/// Broadcaster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    /// Not registered on the relay
    Stopped,
    /// Registering the broadcaster identity
    Starting,
    /// Accepting viewers
    Live,
    /// Closing viewer calls and the channel
    Stopping,
}

/// Decision of an `AdmissionPolicy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Answer the call
    Accept,
    /// Refuse the call with a reason sent to the caller
    Reject(String),
}

/// Hook deciding whether an inbound viewer call is answered
pub trait AdmissionPolicy: Send + Sync {
    /// Decide for `caller` given the number of viewers currently connected
    fn admit(&self, caller: &str, live_viewers: usize) -> Admission;
}

/// Admits every viewer
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn admit(&self, _caller: &str, _live_viewers: usize) -> Admission {
        Admission::Accept
    }
}

/// Snapshot of one connected viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerInfo {
    /// Viewer relay id
    pub identity: String,
    /// Call serving this viewer
    pub call_id: CallId,
    /// Time since the call connected
    pub connected_for: Duration,
}

struct LiveRun {
    id: u64,
    channel: Arc<SignalingChannel>,
    shutdown: watch::Sender<bool>,
    accept_loop: JoinHandle<()>,
}

struct BroadcastInner {
    relay: Arc<dyn Relay>,
    negotiator: MediaCallNegotiator,
    config: BroadcastConfig,
    admission: Arc<dyn AdmissionPolicy>,
    state: watch::Sender<BroadcastState>,
    health: watch::Sender<SessionHealth>,
    viewers: tokio::sync::Mutex<HashMap<String, BroadcasterCallEntry>>,
    run: tokio::sync::Mutex<Option<LiveRun>>,
    shutdown_signal: Mutex<Option<watch::Sender<bool>>>,
    last_start: Mutex<Option<(EventId, MediaSource)>>,
    identity: Mutex<Option<PeerIdentity>>,
    last_error: Mutex<Option<SessionError>>,
    run_ids: AtomicU64,
}

impl BroadcastInner {
    fn set_state(&self, next: BroadcastState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Broadcast state {:?} -> {:?}", previous, next);
        }
        let health = match next {
            BroadcastState::Live => SessionHealth::Healthy,
            BroadcastState::Starting | BroadcastState::Stopping => SessionHealth::Pending,
            BroadcastState::Stopped => match self.last_error.lock().as_ref() {
                Some(error) => SessionHealth::Failed(error.kind),
                None => SessionHealth::Idle,
            },
        };
        self.health.send_replace(health);
    }

    /// Close every viewer call and the channel of `run`, ending in `Stopped`
    async fn shutdown_run(&self, run: LiveRun, failure: Option<SessionError>) {
        self.set_state(BroadcastState::Stopping);
        run.shutdown.send_replace(true);
        if let Err(e) = run.accept_loop.await {
            if e.is_panic() {
                error!("Accept loop panicked: {}", e);
            }
        }

        let entries: Vec<BroadcasterCallEntry> = {
            let mut viewers = self.viewers.lock().await;
            viewers.drain().map(|(_, entry)| entry).collect()
        };
        let closed = entries.len();
        futures::future::join_all(entries.iter().map(|entry| entry.close())).await;

        run.channel.close();
        *self.last_error.lock() = failure;
        self.set_state(BroadcastState::Stopped);
        info!("Broadcast stopped ({} viewer call(s) closed)", closed);
    }

    /// Relay loss: tear the run down if it is still the current one
    async fn escalate(&self, run_id: u64, kind: FailureKind) {
        let run = {
            let mut run = self.run.lock().await;
            match run.as_ref() {
                Some(current) if current.id == run_id => run.take(),
                _ => None,
            }
        };
        if let Some(run) = run {
            error!("Broadcast channel failed ({:?}); closing all viewers", kind);
            // The run lock is released; a concurrent stop finds nothing to do.
            self.shutdown_run(run, Some(SessionError::new(kind, "relay connection lost")))
                .await;
        }
    }
}

/// Publishing-side session
#[derive(Clone)]
pub struct BroadcastSession {
    inner: Arc<BroadcastInner>,
}

impl BroadcastSession {
    /// Create a stopped broadcaster that admits every viewer
    pub fn new(
        relay: Arc<dyn Relay>,
        transport: Arc<dyn MediaTransport>,
        config: BroadcastConfig,
    ) -> Self {
        Self::with_admission(relay, transport, config, Arc::new(AcceptAll))
    }

    /// Create a stopped broadcaster with an admission policy
    pub fn with_admission(
        relay: Arc<dyn Relay>,
        transport: Arc<dyn MediaTransport>,
        config: BroadcastConfig,
        admission: Arc<dyn AdmissionPolicy>,
    ) -> Self {
        let (state, _) = watch::channel(BroadcastState::Stopped);
        let (health, _) = watch::channel(SessionHealth::Idle);

        Self {
            inner: Arc::new(BroadcastInner {
                relay,
                negotiator: MediaCallNegotiator::new(transport, &config),
                config,
                admission,
                state,
                health,
                viewers: tokio::sync::Mutex::new(HashMap::new()),
                run: tokio::sync::Mutex::new(None),
                shutdown_signal: Mutex::new(None),
                last_start: Mutex::new(None),
                identity: Mutex::new(None),
                last_error: Mutex::new(None),
                run_ids: AtomicU64::new(0),
            }),
        }
    }

    /// Register the broadcaster identity for `event_id` and go live
    ///
    /// # Errors
    ///
    /// - `Error::IdentityAlreadyRegistered` if another broadcaster is live
    /// - `Error::RelayUnreachable` if the relay cannot be reached
    /// - `Error::Cancelled` if `stop` ran while starting
    /// - `Error::InvalidState` if the session is already live
    #[instrument(skip(self, event_id, source), fields(event = %event_id, source = %source.id()))]
    pub async fn start(&self, event_id: EventId, source: MediaSource) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            return Err(Error::InvalidState("broadcast already live".to_string()));
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.inner.shutdown_signal.lock() = Some(shutdown_tx.clone());
        *self.inner.last_start.lock() = Some((event_id.clone(), source.clone()));
        *self.inner.last_error.lock() = None;
        self.inner.set_state(BroadcastState::Starting);

        let identity = broadcaster_identity(&event_id);
        *self.inner.identity.lock() = Some(identity.clone());

        let opened = tokio::select! {
            opened = SignalingChannel::open(self.inner.relay.as_ref(), identity, &self.inner.config) => opened,
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                Err(Error::Cancelled("broadcast stopped while starting".to_string()))
            }
        };

        let channel = match opened {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                match &e {
                    Error::Cancelled(_) => info!("Broadcast start cancelled"),
                    Error::IdentityAlreadyRegistered(id) => {
                        warn!("Another broadcaster already holds {}", id);
                        *self.inner.last_error.lock() = Some(SessionError::from(&e));
                    }
                    other => {
                        warn!("Broadcast failed to start: {}", other);
                        *self.inner.last_error.lock() = Some(SessionError::from(other));
                    }
                }
                self.inner.set_state(BroadcastState::Stopped);
                return Err(e);
            }
        };

        let Some(events) = channel.events() else {
            channel.close();
            self.inner.set_state(BroadcastState::Stopped);
            return Err(Error::InvalidState("channel events already taken".to_string()));
        };

        let id = self.inner.run_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let accept_loop = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            id,
            Arc::clone(&channel),
            events,
            source,
            shutdown_rx,
        ));

        info!("Broadcast live as {}", channel.relay_id());
        *run = Some(LiveRun {
            id,
            channel,
            shutdown: shutdown_tx,
            accept_loop,
        });
        self.inner.set_state(BroadcastState::Live);
        Ok(())
    }

    /// Stop broadcasting. Idempotent, and safe while starting.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if let Some(signal) = self.inner.shutdown_signal.lock().as_ref() {
            signal.send_replace(true);
        }

        let run = self.inner.run.lock().await.take();
        if let Some(run) = run {
            self.inner.shutdown_run(run, None).await;
        }
        Ok(())
    }

    /// Stop, then start again with the last event and source
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if the session was never started, otherwise as
    /// for `start`.
    pub async fn restart(&self) -> Result<()> {
        let (event_id, source) = self
            .inner
            .last_start
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("restart before start".to_string()))?;
        self.stop().await?;
        self.start(event_id, source).await
    }

    /// Current state
    pub fn state(&self) -> BroadcastState {
        *self.inner.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<BroadcastState> {
        self.inner.state.subscribe()
    }

    /// Broadcaster identity of the current or last event
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.inner.identity.lock().clone()
    }

    /// Failure that last ended the session, if any
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.last_error.lock().clone()
    }

    /// Configuration this broadcaster was built with
    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Restart this broadcaster in the background with `config().reconnect`
    pub fn supervise(&self) -> SupervisorHandle {
        supervise_broadcast(self.clone(), self.inner.config.reconnect.clone())
    }

    /// Number of connected viewers
    pub async fn viewer_count(&self) -> usize {
        self.inner.viewers.lock().await.len()
    }

    /// Connected viewers, sorted by identity
    pub async fn viewers(&self) -> Vec<ViewerInfo> {
        let viewers = self.inner.viewers.lock().await;
        let mut infos: Vec<ViewerInfo> = viewers
            .iter()
            .map(|(identity, entry)| ViewerInfo {
                identity: identity.clone(),
                call_id: entry.call_id().clone(),
                connected_for: entry.connected_for(),
            })
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }
}

#[async_trait]
impl Supervised for BroadcastSession {
    async fn retry(&self) -> Result<()> {
        self.restart().await
    }

    async fn stop(&self) -> Result<()> {
        BroadcastSession::stop(self).await
    }

    fn health(&self) -> watch::Receiver<SessionHealth> {
        self.inner.health.subscribe()
    }
}

/// Answer inbound calls until shutdown or relay loss
async fn accept_loop(
    inner: Weak<BroadcastInner>,
    run_id: u64,
    channel: Arc<SignalingChannel>,
    mut events: ReceiverStream<ChannelEvent>,
    source: MediaSource,
    mut shutdown: watch::Receiver<bool>,
) {
    let task_shutdown = shutdown.clone();
    let mut tasks = JoinSet::new();
    let mut failure = None;

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            event = events.next() => match event {
                Some(ChannelEvent::IncomingCallRequest(request)) => {
                    let Some(inner) = inner.upgrade() else { break };
                    tasks.spawn(accept_viewer(
                        inner,
                        Arc::clone(&channel),
                        request,
                        source.clone(),
                        task_shutdown.clone(),
                    ));
                }
                Some(ChannelEvent::ChannelError(kind)) => {
                    failure = Some(kind);
                    break;
                }
                Some(other) => debug!("Broadcaster ignoring {:?}", other),
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Viewer task panicked: {}", e);
                    }
                }
            }
        }
    }

    // In-flight acceptances are cancelled; their routes end with the channel.
    tasks.shutdown().await;

    if let (Some(kind), Some(inner)) = (failure, inner.upgrade()) {
        tokio::spawn(async move { inner.escalate(run_id, kind).await });
    }
    debug!("Accept loop for run {} finished", run_id);
}

/// Admit, answer and track one viewer call until it ends
async fn accept_viewer(
    inner: Arc<BroadcastInner>,
    channel: Arc<SignalingChannel>,
    request: IncomingCall,
    source: MediaSource,
    mut shutdown: watch::Receiver<bool>,
) {
    let caller = request.from.clone();

    let live_viewers = inner.viewers.lock().await.len();
    if let Admission::Reject(reason) = inner.admission.admit(&caller, live_viewers) {
        info!("Refusing viewer {}: {}", caller, reason);
        let reject = SignalMessage::Reject {
            call_id: request.call_id,
            reason,
        };
        if let Err(e) = channel.send(&caller, reject) {
            debug!("Could not refuse viewer {}: {}", caller, e);
        }
        return;
    }

    let handle = match inner
        .negotiator
        .accept_inbound_call(&channel, request, Some(source))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Failed to answer viewer {}: {}", caller, e);
            return;
        }
    };

    let connected = tokio::select! {
        connected = handle.connected() => Some(connected),
        _ = shutdown.wait_for(|stop| *stop) => None,
    };
    match connected {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            debug!("Viewer {} did not connect ({:?}): {}", caller, e.kind(), e);
            return;
        }
        None => {
            handle.close().await;
            return;
        }
    }

    let entry = BroadcasterCallEntry::new(handle.clone());
    let (replaced, count) = {
        let mut viewers = inner.viewers.lock().await;
        let replaced = viewers.insert(caller.clone(), entry);
        (replaced, viewers.len())
    };
    if let Some(old) = replaced {
        info!("Viewer {} reconnected; closing call {}", caller, old.call_id());
        old.close().await;
    }
    info!("Viewer {} connected ({} live)", caller, count);

    let ended = handle.terminated().await;
    let mut viewers = inner.viewers.lock().await;
    let still_current = viewers
        .get(&caller)
        .map(|entry| entry.call_id() == handle.call_id())
        .unwrap_or(false);
    if still_current {
        viewers.remove(&caller);
        info!("Viewer {} left ({}); {} live", caller, ended, viewers.len());
    }
}
