//! One-to-many live broadcast over peer links
//!
//! A broadcaster pushes one local media source to any number of viewers.
//! Peers find each other through a signaling relay using identities derived
//! from the event id, negotiate one media call per viewer, and recover from
//! failures under a retry/backoff supervisor.
//!
//! # Architecture
//!
//! ```text
//! ViewerSession                                BroadcastSession
//!  ├─ SignalingChannel (vw-…)   ── Relay ──     ├─ SignalingChannel (bc-…)
//!  └─ ViewerCall  ── MediaCallNegotiator ──     └─ viewers: relay id -> BroadcasterCallEntry
//!                        │
//!                  MediaTransport (LoopbackTransport | WebRtcTransport)
//!
//! ConnectionSupervisor drives retry() / stop() on either session.
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_broadcast::BroadcastConfig;
//!
//! let config = BroadcastConfig {
//!     relay_url: "ws://localhost:8080/ws".to_string(),
//!     negotiation_timeout_ms: 10_000,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use remotemedia_broadcast::{
//!     BroadcastConfig, BroadcastSession, EventId, LocalRelay, LoopbackTransport, MediaSource,
//!     ViewerSession, ViewerState,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_broadcast::Result<()> {
//! let relay = Arc::new(LocalRelay::new());
//! let transport = Arc::new(LoopbackTransport::new());
//! let event = EventId::new("keynote-2024")?;
//!
//! let broadcast = BroadcastSession::new(relay.clone(), transport.clone(), BroadcastConfig::default());
//! broadcast.start(event.clone(), MediaSource::audio_video("stage")).await?;
//!
//! let viewer = ViewerSession::new(relay, transport, BroadcastConfig::default());
//! assert_eq!(viewer.start(event).await?, ViewerState::Connected);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod session;
pub mod signaling;
pub mod supervisor;

pub use call::{
    BroadcasterCallEntry, CallHandle, CallId, CallState, MediaCall, MediaCallNegotiator,
    ViewerCall,
};
pub use config::{BroadcastConfig, TurnServerConfig};
pub use error::{CallFailure, Error, FailureKind, Result};
pub use identity::{broadcaster_identity, new_viewer_identity, EventId, PeerIdentity, PeerRole};
pub use media::{
    LinkState, LoopbackTransport, MediaKind, MediaSource, MediaTransport, RemoteStream,
    RemoteTrack, SourceTrack, TrackDescriptor, TransportLink,
};
pub use session::{
    AcceptAll, Admission, AdmissionPolicy, BroadcastSession, BroadcastState, SessionError,
    ViewerInfo, ViewerOutcome, ViewerSession, ViewerState,
};
pub use signaling::{
    ChannelEvent, ChannelState, IncomingCall, LocalRelay, Relay, RelayHub, SignalMessage,
    SignalingChannel,
};
pub use supervisor::{
    supervise, supervise_broadcast, supervise_viewer, ConnectionSupervisor, ReconnectionPolicy,
    ReconnectionState, SessionHealth, Supervised, SupervisorDecision, SupervisorHandle,
};

#[cfg(feature = "webrtc")]
pub use media::{WebRtcSourceTrack, WebRtcTransport};
#[cfg(feature = "ws-relay")]
pub use signaling::{RelayServer, RelayServerHandle, WsRelay};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
