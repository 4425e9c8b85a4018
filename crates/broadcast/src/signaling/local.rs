//! In-process relay
//!
//! Routes through a shared `RelayHub` with one pump task per registration.
//! Useful for single-process deployments and as the relay in tests, where
//! `disconnect` and `set_reachable` inject relay faults.

use super::relay::{Envelope, Relay, RelayFrame, RelayHub, RelayLink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Relay living in the current process
#[derive(Clone)]
pub struct LocalRelay {
    hub: Arc<RelayHub>,
    reachable: Arc<AtomicBool>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    /// Create a relay with an empty hub
    pub fn new() -> Self {
        Self::with_hub(Arc::new(RelayHub::new()))
    }

    /// Create a relay front-end over an existing hub
    pub fn with_hub(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared routing hub
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Drop the relay connection held by `peer_id`, as if the network failed
    ///
    /// Returns false if the identity was not registered.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.hub.evict(peer_id)
    }

    /// Refuse (or accept again) new registrations
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether `peer_id` is currently registered
    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.hub.is_registered(peer_id)
    }

    /// Number of registered identities
    pub fn peer_count(&self) -> usize {
        self.hub.peer_count()
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn register(&self, peer_id: &str) -> Result<RelayLink> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::RelayUnreachable("local relay is offline".to_string()));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let registration = self.hub.register(peer_id, inbound_tx)?;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                hub.route(&registration, envelope);
            }
            debug!("Local relay link for {} released", registration.peer_id());
            hub.unregister(&registration);
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use crate::signaling::protocol::SignalMessage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_route_release() {
        let relay = LocalRelay::new();
        let a = relay.register("a").await.unwrap();
        let mut b = relay.register("b").await.unwrap();

        let message = SignalMessage::Hangup { call_id: CallId::new() };
        a.outbound
            .send(Envelope { to: "b".into(), message: message.clone() })
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), b.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, RelayFrame::Message { from: "a".into(), message });

        drop(a);
        let frame = tokio::time::timeout(Duration::from_secs(1), b.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, RelayFrame::PeerGone { peer: "a".into() });
        assert!(!relay.is_registered("a"));
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        let relay = LocalRelay::new();
        relay.set_reachable(false);
        assert!(matches!(
            relay.register("a").await.unwrap_err(),
            Error::RelayUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_ends_inbound() {
        let relay = LocalRelay::new();
        let mut link = relay.register("vw-1").await.unwrap();
        assert!(relay.disconnect("vw-1"));
        assert!(link.inbound.recv().await.is_none());
    }
}
