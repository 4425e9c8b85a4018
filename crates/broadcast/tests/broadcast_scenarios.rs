//! Broadcaster / viewer integration tests
//!
//! Every test runs against an in-process relay and loopback media links.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p remotemedia-broadcast --test broadcast_scenarios
//! ```

mod harness;

use async_trait::async_trait;
use harness::{wait_for, wait_for_offline, wait_for_viewer_count, wait_until, BroadcastHarness};
use remotemedia_broadcast::signaling::RelayLink;
use remotemedia_broadcast::{
    broadcaster_identity, new_viewer_identity, Admission, AdmissionPolicy, BroadcastConfig,
    BroadcastSession, BroadcastState, CallFailure, CallState, Error, EventId, FailureKind,
    LoopbackTransport, MediaCallNegotiator, MediaSource, Relay, SessionError, SignalingChannel,
    ViewerOutcome, ViewerSession, ViewerState,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn test_viewer_sees_absent_broadcast_as_offline() {
    let h = BroadcastHarness::new("evt-absent");
    let viewer = h.viewer();

    let state = viewer.start(h.event.clone()).await.unwrap();
    assert_eq!(
        state,
        ViewerState::Offline {
            reason: Some(CallFailure::PeerUnavailable)
        }
    );
    assert_eq!(viewer.outcome(), ViewerOutcome::NotAvailable);
    assert!(viewer.remote_stream().is_none());
}

#[tokio::test]
async fn test_viewer_connects_to_live_broadcast() {
    let h = BroadcastHarness::new("evt-live");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();

    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    assert_eq!(viewer.outcome(), ViewerOutcome::Live);

    let stream = viewer.remote_stream().expect("stream while connected");
    assert_eq!(stream.id, "stage");
    assert_eq!(stream.tracks.len(), 2);

    wait_for_viewer_count(&broadcaster, 1).await;
    let viewers = broadcaster.viewers().await;
    assert_eq!(
        viewers[0].identity,
        viewer.identity().unwrap().relay_id()
    );
    assert_eq!(h.transport.attachment_count("stage"), 1);
}

#[tokio::test]
async fn test_second_broadcaster_is_refused() {
    let h = BroadcastHarness::new("evt-dup");
    let first = h.live_broadcaster().await;
    let second = h.broadcaster();

    let err = second.start(h.event.clone(), h.source()).await.unwrap_err();
    assert!(matches!(err, Error::IdentityAlreadyRegistered(_)));
    assert_eq!(second.state(), BroadcastState::Stopped);
    assert_eq!(
        second.last_error().map(|e| e.kind),
        Some(FailureKind::IdentityAlreadyRegistered)
    );

    assert_eq!(first.state(), BroadcastState::Live);
}

#[tokio::test]
async fn test_concurrent_broadcasters_exactly_one_live() {
    let h = BroadcastHarness::new("evt-race");
    let a = h.broadcaster();
    let b = h.broadcaster();

    let (ra, rb) = tokio::join!(
        a.start(h.event.clone(), h.source()),
        b.start(h.event.clone(), h.source())
    );

    let live = [&a, &b]
        .iter()
        .filter(|s| s.state() == BroadcastState::Live)
        .count();
    assert_eq!(live, 1);
    assert_eq!(ra.is_ok() as usize + rb.is_ok() as usize, 1);
    let err = ra.err().or(rb.err()).unwrap();
    assert!(matches!(err, Error::IdentityAlreadyRegistered(_)));
}

#[tokio::test]
async fn test_broadcaster_stop_takes_viewers_offline() {
    let h = BroadcastHarness::new("evt-stop");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();
    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    broadcaster.stop().await.unwrap();
    assert_eq!(broadcaster.state(), BroadcastState::Stopped);
    assert_eq!(broadcaster.viewer_count().await, 0);

    let state = wait_for_offline(&viewer).await;
    assert!(matches!(state, ViewerState::Offline { .. }));
    assert!(viewer.remote_stream().is_none());

    let transport = h.transport.clone();
    wait_until("source detached", move || {
        let transport = transport.clone();
        async move { transport.attachment_count("stage") == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_relay_drop_puts_viewer_in_error() {
    let h = BroadcastHarness::new("evt-relay");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();
    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    let viewer_id = viewer.identity().unwrap().relay_id();
    assert!(h.relay.disconnect(&viewer_id));

    let mut rx = viewer.subscribe();
    let state = wait_for(&mut rx, |s| matches!(s, ViewerState::Error(_))).await;
    assert!(matches!(
        state,
        ViewerState::Error(SessionError {
            kind: FailureKind::RelayUnreachable,
            ..
        })
    ));

    // The broadcaster sees the viewer leave; other state is untouched.
    wait_for_viewer_count(&broadcaster, 0).await;
    assert_eq!(broadcaster.state(), BroadcastState::Live);
}

// ============================================================================
// Fan-out and reconnects
// ============================================================================

#[tokio::test]
async fn test_concurrent_viewers_are_counted_once() {
    const VIEWERS: usize = 8;

    let h = BroadcastHarness::new("evt-fanout");
    let broadcaster = h.live_broadcaster().await;
    let viewers: Vec<_> = (0..VIEWERS).map(|_| h.viewer()).collect();

    let states = futures::future::join_all(viewers.iter().map(|v| v.start(h.event.clone()))).await;
    for state in states {
        assert_eq!(state.unwrap(), ViewerState::Connected);
    }

    wait_for_viewer_count(&broadcaster, VIEWERS).await;

    let expected: HashSet<String> = viewers
        .iter()
        .map(|v| v.identity().unwrap().relay_id())
        .collect();
    let listed: HashSet<String> = broadcaster
        .viewers()
        .await
        .into_iter()
        .map(|info| info.identity)
        .collect();
    assert_eq!(expected, listed);
    assert_eq!(h.transport.attachment_count("stage"), VIEWERS);

    // One viewer leaving does not disturb the others.
    viewers[0].stop().await;
    wait_for_viewer_count(&broadcaster, VIEWERS - 1).await;
    for viewer in &viewers[1..] {
        assert_eq!(viewer.state(), ViewerState::Connected);
    }
}

#[tokio::test]
async fn test_retry_leaves_no_dangling_call() {
    let h = BroadcastHarness::new("evt-retry");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();
    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    let first_id = viewer.identity().unwrap().relay_id();

    let state = viewer.retry().await.unwrap();
    assert_eq!(state, ViewerState::Connected);

    let second_id = viewer.identity().unwrap().relay_id();
    assert_ne!(first_id, second_id);

    let b = &broadcaster;
    let expected = second_id.clone();
    wait_until("only the new call listed", move || {
        let expected = expected.clone();
        async move {
            let viewers = b.viewers().await;
            viewers.len() == 1 && viewers[0].identity == expected
        }
    })
    .await;

    // The old channel unregisters asynchronously.
    let relay = h.relay.clone();
    wait_until("old identity released", move || {
        let relay = relay.clone();
        let id = first_id.clone();
        async move { !relay.is_registered(&id) }
    })
    .await;
}

#[tokio::test]
async fn test_same_identity_replaces_entry() {
    let h = BroadcastHarness::new("evt-replace");
    let broadcaster = h.live_broadcaster().await;

    let identity = new_viewer_identity(&h.event).unwrap();
    let channel = Arc::new(
        SignalingChannel::open(&h.relay, identity.clone(), &h.config)
            .await
            .unwrap(),
    );
    let negotiator = MediaCallNegotiator::new(Arc::new(h.transport.clone()), &h.config);
    let target = broadcaster_identity(&h.event);

    let first = negotiator.place_call(&channel, &target, None).await.unwrap();
    assert_eq!(first.settled().await, CallState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    let second = negotiator.place_call(&channel, &target, None).await.unwrap();
    assert_eq!(second.settled().await, CallState::Connected);

    // The broadcaster closes the replaced call and hangs up on it.
    assert!(first.terminated().await.is_terminal());

    let b = &broadcaster;
    let second_call = second.call_id().clone();
    wait_until("entry replaced", move || {
        let second_call = second_call.clone();
        async move {
            let viewers = b.viewers().await;
            viewers.len() == 1 && viewers[0].call_id == second_call
        }
    })
    .await;
    assert_eq!(second.state(), CallState::Connected);
}

#[tokio::test]
async fn test_transport_loss_removes_viewer() {
    let h = BroadcastHarness::new("evt-loss");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();
    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    let viewer_id = viewer.identity().unwrap().relay_id();
    assert_eq!(h.transport.sever(&viewer_id), 1);

    let state = wait_for_offline(&viewer).await;
    assert!(matches!(state, ViewerState::Offline { reason: Some(_) }));
    wait_for_viewer_count(&broadcaster, 0).await;
}

#[tokio::test]
async fn test_stalled_media_times_out_to_offline() {
    let h = BroadcastHarness::new("evt-stall");
    let broadcaster = h.live_broadcaster().await;
    h.transport.set_stalled(true);

    let viewer = h.viewer();
    let started = Instant::now();
    let state = viewer.start(h.event.clone()).await.unwrap();
    assert_eq!(
        state,
        ViewerState::Offline {
            reason: Some(CallFailure::NegotiationTimeout)
        }
    );
    assert!(started.elapsed() < h.config.relay_connect_timeout() + h.config.negotiation_timeout());
    assert_eq!(broadcaster.viewer_count().await, 0);
}

// ============================================================================
// Idempotence and admission
// ============================================================================

#[tokio::test]
async fn test_double_stop_is_side_effect_free() {
    let h = BroadcastHarness::new("evt-idem");
    let broadcaster = h.live_broadcaster().await;
    let viewer = h.viewer();
    assert_eq!(viewer.start(h.event.clone()).await.unwrap(), ViewerState::Connected);

    viewer.stop().await;
    viewer.stop().await;
    assert_eq!(viewer.state(), ViewerState::Idle);
    assert!(viewer.identity().is_none());

    broadcaster.stop().await.unwrap();
    broadcaster.stop().await.unwrap();
    assert_eq!(broadcaster.state(), BroadcastState::Stopped);
    assert!(broadcaster.last_error().is_none());

    // A stopped broadcaster can go live again under the same identity.
    let relay = h.relay.clone();
    let id = broadcaster_identity(&h.event).relay_id();
    wait_until("identity released", move || {
        let relay = relay.clone();
        let id = id.clone();
        async move { !relay.is_registered(&id) }
    })
    .await;
    broadcaster.restart().await.unwrap();
    assert_eq!(broadcaster.state(), BroadcastState::Live);
}

struct Capacity(usize);

impl AdmissionPolicy for Capacity {
    fn admit(&self, _caller: &str, live_viewers: usize) -> Admission {
        if live_viewers < self.0 {
            Admission::Accept
        } else {
            Admission::Reject("event is full".to_string())
        }
    }
}

#[tokio::test]
async fn test_admission_policy_rejects_viewer() {
    let h = BroadcastHarness::new("evt-full");
    let broadcaster = BroadcastSession::with_admission(
        Arc::new(h.relay.clone()),
        Arc::new(h.transport.clone()),
        h.config.clone(),
        Arc::new(Capacity(1)),
    );
    broadcaster.start(h.event.clone(), h.source()).await.unwrap();

    let first = h.viewer();
    assert_eq!(first.start(h.event.clone()).await.unwrap(), ViewerState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    let second = h.viewer();
    let state = second.start(h.event.clone()).await.unwrap();
    assert_eq!(
        state,
        ViewerState::Offline {
            reason: Some(CallFailure::Rejected("event is full".to_string()))
        }
    );
    assert_eq!(broadcaster.viewer_count().await, 1);
}

// ============================================================================
// Stop while starting
// ============================================================================

/// Relay that accepts the connection attempt but never completes registration
struct HangingRelay;

#[async_trait]
impl Relay for HangingRelay {
    async fn register(&self, _peer_id: &str) -> remotemedia_broadcast::Result<RelayLink> {
        std::future::pending().await
    }
}

fn hanging_config() -> BroadcastConfig {
    BroadcastConfig {
        relay_connect_timeout_ms: 30_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_broadcaster_stop_cancels_start() {
    harness::init_logging();
    let broadcaster = BroadcastSession::new(
        Arc::new(HangingRelay),
        Arc::new(LoopbackTransport::new()),
        hanging_config(),
    );
    let event = EventId::new("evt-hang-bc").unwrap();

    let starting = {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            broadcaster
                .start(event, MediaSource::audio_video("stage"))
                .await
        })
    };
    let mut state = broadcaster.subscribe();
    wait_for(&mut state, |s| *s == BroadcastState::Starting).await;

    broadcaster.stop().await.unwrap();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled(_))));
    assert_eq!(broadcaster.state(), BroadcastState::Stopped);
    assert!(broadcaster.last_error().is_none());
}

#[tokio::test]
async fn test_viewer_stop_cancels_start() {
    harness::init_logging();
    let viewer = ViewerSession::new(
        Arc::new(HangingRelay),
        Arc::new(LoopbackTransport::new()),
        hanging_config(),
    );
    let event = EventId::new("evt-hang-vw").unwrap();

    let starting = {
        let viewer = viewer.clone();
        tokio::spawn(async move { viewer.start(event).await })
    };
    let mut state = viewer.subscribe();
    wait_for(&mut state, |s| *s == ViewerState::Connecting).await;

    viewer.stop().await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled(_))));
    assert_eq!(viewer.state(), ViewerState::Idle);
    assert_eq!(viewer.outcome(), ViewerOutcome::NotAvailable);
}
