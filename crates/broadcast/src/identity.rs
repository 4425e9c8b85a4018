//! Peer identity derivation
//!
//! Every endpoint on the relay is addressed by a string identity. The
//! broadcaster identity is a pure function of the event id so viewers can
//! call it without a discovery step; viewer identities carry a random
//! disambiguator and are never reused after a failed attempt.

use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain separator mixed into the event digest
const IDENTITY_NAMESPACE: &str = "remotemedia-broadcast:";

/// Prefix of every broadcaster identity
pub const BROADCASTER_PREFIX: &str = "bc";

/// Prefix of every viewer identity
pub const VIEWER_PREFIX: &str = "vw";

/// Bytes of OS entropy in a viewer disambiguator (64 bits)
pub const VIEWER_ENTROPY_BYTES: usize = 8;

/// Opaque, externally supplied identifier of one broadcast event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// Create an event id. Empty or whitespace-only ids are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidConfig("event id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_NAMESPACE.as_bytes());
        hasher.update(self.0.as_bytes());
        hasher.finalize().into()
    }
}

impl TryFrom<String> for EventId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EventId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of a broadcast an identity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Publishes the single outgoing stream
    Broadcaster,
    /// Watches the broadcast
    Viewer,
}

/// Relay address of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    role: PeerRole,
    event_id: EventId,
    disambiguator: String,
}

impl PeerIdentity {
    /// Role of this identity
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Event this identity is scoped to
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Disambiguator part (hex)
    pub fn disambiguator(&self) -> &str {
        &self.disambiguator
    }

    /// String under which this identity registers on the relay
    pub fn relay_id(&self) -> String {
        match self.role {
            PeerRole::Broadcaster => format!("{}-{}", BROADCASTER_PREFIX, self.disambiguator),
            PeerRole::Viewer => format!(
                "{}-{}-{}",
                VIEWER_PREFIX,
                hex::encode(&self.event_id.digest()[..4]),
                self.disambiguator
            ),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relay_id())
    }
}

/// Deterministic broadcaster identity for an event
///
/// Pure and total: the same event id yields the same identity in every
/// process, so exactly one broadcaster address exists per event.
pub fn broadcaster_identity(event_id: &EventId) -> PeerIdentity {
    PeerIdentity {
        role: PeerRole::Broadcaster,
        event_id: event_id.clone(),
        disambiguator: hex::encode(&event_id.digest()[..16]),
    }
}

/// Fresh viewer identity with 64 bits of OS entropy
///
/// # Errors
///
/// `Error::EntropyUnavailable` if the OS random source fails. This is fatal.
pub fn new_viewer_identity(event_id: &EventId) -> Result<PeerIdentity> {
    let mut entropy = [0u8; VIEWER_ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| Error::EntropyUnavailable(e.to_string()))?;

    Ok(PeerIdentity {
        role: PeerRole::Viewer,
        event_id: event_id.clone(),
        disambiguator: hex::encode(entropy),
    })
}
