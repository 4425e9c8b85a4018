//! Signaling: relay abstraction, relay implementations, and the channel
//!
//! - `protocol`: `SignalMessage` payloads and the JSON-RPC 2.0 wire format
//! - `relay`: the `Relay` trait and the shared `RelayHub`
//! - `local`: in-process relay
//! - `websocket` / `server`: WebSocket relay client and server (feature `ws-relay`)
//! - `channel`: `SignalingChannel`, one registered relay connection

pub mod channel;
pub mod local;
pub mod protocol;
pub mod relay;

#[cfg(feature = "ws-relay")]
pub mod server;
#[cfg(feature = "ws-relay")]
pub mod websocket;

pub use channel::{ChannelEvent, ChannelState, IncomingCall, SignalingChannel};
pub use local::LocalRelay;
pub use protocol::SignalMessage;
pub use relay::{Envelope, HubRegistration, Relay, RelayFrame, RelayHub, RelayLink};

#[cfg(feature = "ws-relay")]
pub use server::{RelayServer, RelayServerHandle};
#[cfg(feature = "ws-relay")]
pub use websocket::WsRelay;
