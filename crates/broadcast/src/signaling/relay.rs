//! Relay abstraction and the shared routing hub
//!
//! A relay lets identities exchange `SignalMessage`s without being directly
//! reachable. The core relies on three guarantees only:
//! 1. identity registration is exclusive per relay instance,
//! 2. messages addressed to a registered identity reach exactly that identity,
//! 3. closure of a registration is observable by peers it talked to.
//!
//! `RelayHub` implements those guarantees once; `LocalRelay` and the
//! WebSocket `RelayServer` both route through it.

use super::protocol::SignalMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound message addressed to another identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Recipient relay id
    pub to: String,
    /// Payload
    pub message: SignalMessage,
}

/// Inbound frame delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Signal from another identity
    Message {
        /// Sender relay id
        from: String,
        /// Payload
        message: SignalMessage,
    },
    /// An identity this connection exchanged signals with is gone
    PeerGone {
        /// Departed relay id
        peer: String,
    },
    /// A previously sent envelope had no registered recipient
    Undeliverable {
        /// Unregistered relay id
        to: String,
    },
    /// The relay received something it could not decode for this connection
    Malformed {
        /// Decoder diagnostics
        detail: String,
    },
}

/// One registered relay connection
///
/// Dropping `outbound` releases the registration. The end of `inbound`
/// means the relay connection was lost.
#[derive(Debug)]
pub struct RelayLink {
    /// Sender for envelopes to the relay
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Receiver for frames from the relay
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

/// Connection factory for a signaling relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Open a relay connection registered under `peer_id`
    ///
    /// # Errors
    ///
    /// - `Error::IdentityAlreadyRegistered` if another live connection holds `peer_id`
    /// - `Error::RelayUnreachable` if the relay cannot be reached
    async fn register(&self, peer_id: &str) -> Result<RelayLink>;

    /// Short name for logs
    fn name(&self) -> &str {
        "relay"
    }
}

/// Proof of a hub registration, needed to route and unregister
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRegistration {
    peer_id: String,
    conn_id: u64,
}

impl HubRegistration {
    /// Registered relay id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

struct HubPeer {
    conn_id: u64,
    tx: mpsc::UnboundedSender<RelayFrame>,
    contacts: HashSet<String>,
}

/// Exclusive identity table plus routing, shared by relay front-ends
#[derive(Default)]
pub struct RelayHub {
    peers: Mutex<HashMap<String, HubPeer>>,
    next_conn_id: AtomicU64,
}

impl RelayHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id`, delivering its inbound frames to `tx`
    pub fn register(
        &self,
        peer_id: &str,
        tx: mpsc::UnboundedSender<RelayFrame>,
    ) -> Result<HubRegistration> {
        let mut peers = self.peers.lock();

        if let Some(existing) = peers.get(peer_id) {
            // A registration whose receiver is gone is stale, not live.
            if !existing.tx.is_closed() {
                return Err(Error::IdentityAlreadyRegistered(peer_id.to_string()));
            }
            debug!("Replacing stale registration for {}", peer_id);
            // Contacts of the dead connection must still see it leave.
            Self::remove_locked(&mut peers, peer_id);
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        peers.insert(
            peer_id.to_string(),
            HubPeer {
                conn_id,
                tx,
                contacts: HashSet::new(),
            },
        );

        debug!("Relay registered {} (total: {})", peer_id, peers.len());

        Ok(HubRegistration {
            peer_id: peer_id.to_string(),
            conn_id,
        })
    }

    /// Route an envelope from a registered connection
    ///
    /// Unknown recipients produce `RelayFrame::Undeliverable` back to the
    /// sender. Envelopes from stale registrations are dropped.
    pub fn route(&self, from: &HubRegistration, envelope: Envelope) {
        let mut peers = self.peers.lock();

        let sender_live = peers
            .get(&from.peer_id)
            .map(|p| p.conn_id == from.conn_id)
            .unwrap_or(false);
        if !sender_live {
            debug!("Dropping envelope from stale registration {}", from.peer_id);
            return;
        }

        let delivered = match peers.get_mut(&envelope.to) {
            Some(recipient) => {
                recipient.contacts.insert(from.peer_id.clone());
                recipient
                    .tx
                    .send(RelayFrame::Message {
                        from: from.peer_id.clone(),
                        message: envelope.message,
                    })
                    .is_ok()
            }
            None => false,
        };

        if let Some(sender) = peers.get_mut(&from.peer_id) {
            if delivered {
                sender.contacts.insert(envelope.to);
            } else {
                let _ = sender.tx.send(RelayFrame::Undeliverable { to: envelope.to });
            }
        }
    }

    /// Release a registration and notify its contacts
    pub fn unregister(&self, registration: &HubRegistration) {
        let mut peers = self.peers.lock();
        let current = peers
            .get(&registration.peer_id)
            .map(|p| p.conn_id == registration.conn_id)
            .unwrap_or(false);
        if current {
            Self::remove_locked(&mut peers, &registration.peer_id);
        }
    }

    /// Forcibly drop the connection registered under `peer_id`
    ///
    /// The evicted connection observes the end of its inbound stream.
    pub fn evict(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.lock();
        let evicted = Self::remove_locked(&mut peers, peer_id);
        if evicted {
            info!("Relay evicted {}", peer_id);
        }
        evicted
    }

    fn remove_locked(peers: &mut HashMap<String, HubPeer>, peer_id: &str) -> bool {
        let Some(gone) = peers.remove(peer_id) else {
            return false;
        };

        for contact in gone.contacts {
            if let Some(peer) = peers.get_mut(&contact) {
                peer.contacts.remove(peer_id);
                if peer
                    .tx
                    .send(RelayFrame::PeerGone {
                        peer: peer_id.to_string(),
                    })
                    .is_err()
                {
                    warn!("Could not notify {} that {} left", contact, peer_id);
                }
            }
        }

        debug!("Relay unregistered {} (total: {})", peer_id, peers.len());
        true
    }

    /// Whether `peer_id` currently holds a registration
    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    /// Number of registered identities
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}
