//! Broadcast test harness
//!
//! One in-process relay and one loopback transport shared by every session
//! the harness creates, with short timeouts so failure paths settle fast.
//!
//! Basic usage pattern:
//!
//! 1. Create a `BroadcastHarness` for an event
//! 2. Create sessions with `broadcaster()` and `viewer()`
//! 3. Inject faults through `relay` and `transport`
//! 4. Wait on state with the `wait_*` helpers

#![allow(dead_code)]

use remotemedia_broadcast::{
    BroadcastConfig, BroadcastSession, EventId, LocalRelay, LoopbackTransport, MediaSource,
    ReconnectionPolicy, ViewerSession, ViewerState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound for any wait in the tests
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,remotemedia_broadcast=debug")
        .with_test_writer()
        .try_init();
}

/// Shared relay, transport and config for one event
pub struct BroadcastHarness {
    pub relay: LocalRelay,
    pub transport: LoopbackTransport,
    pub config: BroadcastConfig,
    pub event: EventId,
}

impl BroadcastHarness {
    /// Harness for `event` with fast timeouts
    pub fn new(event: &str) -> Self {
        init_logging();
        Self {
            relay: LocalRelay::new(),
            transport: LoopbackTransport::new(),
            config: BroadcastConfig {
                relay_connect_timeout_ms: 500,
                negotiation_timeout_ms: 1000,
                reconnect: fast_policy(),
                ..Default::default()
            },
            event: EventId::new(event).expect("valid event id"),
        }
    }

    /// New stopped broadcaster
    pub fn broadcaster(&self) -> BroadcastSession {
        BroadcastSession::new(
            Arc::new(self.relay.clone()),
            Arc::new(self.transport.clone()),
            self.config.clone(),
        )
    }

    /// New idle viewer
    pub fn viewer(&self) -> ViewerSession {
        ViewerSession::new(
            Arc::new(self.relay.clone()),
            Arc::new(self.transport.clone()),
            self.config.clone(),
        )
    }

    /// Broadcaster already live with `source()`
    pub async fn live_broadcaster(&self) -> BroadcastSession {
        let broadcaster = self.broadcaster();
        broadcaster
            .start(self.event.clone(), self.source())
            .await
            .expect("broadcaster goes live");
        broadcaster
    }

    /// Source shared by broadcasters of this harness
    pub fn source(&self) -> MediaSource {
        MediaSource::audio_video("stage")
    }
}

/// Backoff fast enough for tests
pub fn fast_policy() -> ReconnectionPolicy {
    ReconnectionPolicy {
        initial_backoff_ms: 20,
        max_backoff_ms: 100,
        jitter_ratio: 0.0,
        ..Default::default()
    }
}

/// Poll `condition` every few milliseconds until it holds
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the broadcaster reports `count` viewers
pub async fn wait_for_viewer_count(broadcaster: &BroadcastSession, count: usize) {
    wait_until(&format!("{} viewer(s)", count), move || async move {
        broadcaster.viewer_count().await == count
    })
    .await;
}

/// Wait until a watched value satisfies `predicate`, returning it
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(predicate))
        .await
        .expect("state change before timeout")
        .expect("sender alive")
        .clone()
}

/// Wait until the viewer is `Offline`
pub async fn wait_for_offline(viewer: &ViewerSession) -> ViewerState {
    let mut rx = viewer.subscribe();
    wait_for(&mut rx, |s| matches!(s, ViewerState::Offline { .. })).await
}
