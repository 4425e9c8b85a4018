//! End-to-end tests over the WebSocket relay
//!
//! A `RelayServer` is bound on a random local port; sessions reach it
//! through `WsRelay` and pair media through a shared loopback transport.

#![cfg(feature = "ws-relay")]

mod harness;

use harness::{init_logging, wait_for_offline, wait_for_viewer_count};
use remotemedia_broadcast::{
    BroadcastConfig, BroadcastSession, Error, EventId, LoopbackTransport, MediaSource,
    RelayServer, RelayServerHandle, ViewerSession, ViewerState, WsRelay,
};
use std::sync::Arc;

async fn start_server() -> RelayServerHandle {
    RelayServer::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

fn config(url: &str) -> BroadcastConfig {
    BroadcastConfig {
        relay_url: url.to_string(),
        relay_connect_timeout_ms: 2000,
        negotiation_timeout_ms: 2000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_viewer_connects_through_websocket_relay() {
    init_logging();
    let server = start_server().await;
    let url = server.url();
    let transport = LoopbackTransport::new();
    let event = EventId::new("evt-ws").unwrap();

    let broadcaster = BroadcastSession::new(
        Arc::new(WsRelay::from_config(&config(&url))),
        Arc::new(transport.clone()),
        config(&url),
    );
    broadcaster
        .start(event.clone(), MediaSource::audio_video("stage"))
        .await
        .unwrap();

    let viewer = ViewerSession::new(
        Arc::new(WsRelay::new(&url)),
        Arc::new(transport.clone()),
        config(&url),
    );
    assert_eq!(viewer.start(event.clone()).await.unwrap(), ViewerState::Connected);
    wait_for_viewer_count(&broadcaster, 1).await;

    broadcaster.stop().await.unwrap();
    wait_for_offline(&viewer).await;

    viewer.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_broadcaster_over_websocket() {
    init_logging();
    let server = start_server().await;
    let url = server.url();
    let transport = Arc::new(LoopbackTransport::new());
    let event = EventId::new("evt-ws-dup").unwrap();

    let first = BroadcastSession::new(Arc::new(WsRelay::new(&url)), transport.clone(), config(&url));
    first
        .start(event.clone(), MediaSource::audio_video("a"))
        .await
        .unwrap();

    let second = BroadcastSession::new(Arc::new(WsRelay::new(&url)), transport, config(&url));
    let err = second
        .start(event, MediaSource::audio_video("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IdentityAlreadyRegistered(_)));

    first.stop().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_absent_broadcast_over_websocket_is_offline() {
    init_logging();
    let server = start_server().await;
    let url = server.url();

    let viewer = ViewerSession::new(
        Arc::new(WsRelay::new(&url)),
        Arc::new(LoopbackTransport::new()),
        config(&url),
    );
    let state = viewer.start(EventId::new("evt-ws-none").unwrap()).await.unwrap();
    assert!(matches!(state, ViewerState::Offline { .. }));
    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_websocket_relay_is_error() {
    init_logging();
    // Bind and drop to get a port nobody listens on.
    let server = start_server().await;
    let url = server.url();
    server.shutdown().await;

    let viewer = ViewerSession::new(
        Arc::new(WsRelay::new(&url)),
        Arc::new(LoopbackTransport::new()),
        config(&url),
    );
    let state = viewer.start(EventId::new("evt-ws-down").unwrap()).await.unwrap();
    assert!(matches!(state, ViewerState::Error(_)));
}
