//! Error types for broadcast orchestration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias using the broadcast Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating broadcast and viewer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another live channel already holds this identity on the relay
    #[error("Identity already registered: {0}")]
    IdentityAlreadyRegistered(String),

    /// The relay could not be reached or the relay connection dropped
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),

    /// A malformed or out-of-sequence signaling message was received
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No answer (or no live media path) within the negotiation timeout
    #[error("Negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// The media path was lost after the call connected
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// The OS entropy source failed while generating a viewer identity
    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation cancelled by a concurrent stop or close
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Signaling channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Call failed before reaching the connected state
    #[error("Call failed: {0}")]
    CallFailed(CallFailure),

    /// Media transport error
    #[error("Media transport error: {0}")]
    MediaTransport(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RelayUnreachable(_)
                | Error::NegotiationTimeout(_)
                | Error::TransportLost(_)
                | Error::IoError(_)
        ) || matches!(self, Error::CallFailed(reason) if reason.is_retryable())
    }

    /// Check if this error must never be retried automatically
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IdentityAlreadyRegistered(_)
                | Error::EntropyUnavailable(_)
                | Error::InvalidConfig(_)
        )
    }

    /// Classify this error for retry decisions
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::IdentityAlreadyRegistered(_) => FailureKind::IdentityAlreadyRegistered,
            Error::RelayUnreachable(_) | Error::IoError(_) => FailureKind::RelayUnreachable,
            Error::ProtocolViolation(_) | Error::SerializationError(_) => {
                FailureKind::ProtocolViolation
            }
            Error::NegotiationTimeout(_) => FailureKind::NegotiationTimeout,
            Error::TransportLost(_) => FailureKind::TransportLost,
            Error::EntropyUnavailable(_) => FailureKind::EntropyUnavailable,
            Error::CallFailed(reason) => reason.kind(),
            _ => FailureKind::Other,
        }
    }
}

/// Coarse failure classification shared by sessions and the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Relay identity held by another live channel
    IdentityAlreadyRegistered,
    /// Relay connection could not be established or dropped
    RelayUnreachable,
    /// Malformed signaling exchange
    ProtocolViolation,
    /// Peer did not answer in time
    NegotiationTimeout,
    /// Media path lost after connect
    TransportLost,
    /// Remote peer rejected the call or is not registered
    PeerUnavailable,
    /// OS entropy source failed
    EntropyUnavailable,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Fatal failures are surfaced immediately instead of retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureKind::IdentityAlreadyRegistered | FailureKind::EntropyUnavailable
        )
    }
}

/// Reason a single media call ended in the `Failed` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// No answer or no live media path before the negotiation deadline
    NegotiationTimeout,
    /// Media path reported lost after the call connected
    TransportLost,
    /// Remote peer explicitly refused the call
    Rejected(String),
    /// Target identity is not registered on the relay
    PeerUnavailable,
    /// The signaling channel carrying this call failed or was closed
    ChannelLost,
    /// Media transport refused to set up the link
    Transport(String),
    /// Malformed offer or answer
    ProtocolViolation(String),
}

impl CallFailure {
    /// Classify for retry decisions
    pub fn kind(&self) -> FailureKind {
        match self {
            CallFailure::NegotiationTimeout => FailureKind::NegotiationTimeout,
            CallFailure::TransportLost => FailureKind::TransportLost,
            CallFailure::Rejected(_) | CallFailure::PeerUnavailable => FailureKind::PeerUnavailable,
            CallFailure::ChannelLost => FailureKind::RelayUnreachable,
            CallFailure::Transport(_) => FailureKind::Other,
            CallFailure::ProtocolViolation(_) => FailureKind::ProtocolViolation,
        }
    }

    /// Whether the failure means "peer not reachable right now" rather than a
    /// relay or protocol fault
    pub fn is_peer_absent(&self) -> bool {
        matches!(
            self,
            CallFailure::NegotiationTimeout
                | CallFailure::TransportLost
                | CallFailure::Rejected(_)
                | CallFailure::PeerUnavailable
                | CallFailure::Transport(_)
        )
    }

    /// Check if retrying the call later could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CallFailure::ProtocolViolation(_))
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::NegotiationTimeout => write!(f, "negotiation timed out"),
            CallFailure::TransportLost => write!(f, "media transport lost"),
            CallFailure::Rejected(reason) => write!(f, "rejected by remote: {}", reason),
            CallFailure::PeerUnavailable => write!(f, "remote peer not registered"),
            CallFailure::ChannelLost => write!(f, "signaling channel lost"),
            CallFailure::Transport(detail) => write!(f, "transport error: {}", detail),
            CallFailure::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
        }
    }
}

impl From<CallFailure> for Error {
    fn from(reason: CallFailure) -> Self {
        match reason {
            CallFailure::NegotiationTimeout => {
                Error::NegotiationTimeout("no answer before deadline".to_string())
            }
            CallFailure::TransportLost => Error::TransportLost("media path lost".to_string()),
            CallFailure::ProtocolViolation(detail) => Error::ProtocolViolation(detail),
            CallFailure::ChannelLost => {
                Error::RelayUnreachable("signaling channel lost".to_string())
            }
            other => Error::CallFailed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::IdentityAlreadyRegistered("bc-1234".to_string());
        assert_eq!(err.to_string(), "Identity already registered: bc-1234");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::RelayUnreachable("down".to_string()).is_retryable());
        assert!(Error::NegotiationTimeout("slow".to_string()).is_retryable());
        assert!(!Error::IdentityAlreadyRegistered("bc".to_string()).is_retryable());
        assert!(Error::CallFailed(CallFailure::PeerUnavailable).is_retryable());
        assert!(!Error::CallFailed(CallFailure::ProtocolViolation("x".into())).is_retryable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::IdentityAlreadyRegistered("bc".to_string()).is_fatal());
        assert!(Error::EntropyUnavailable("getrandom".to_string()).is_fatal());
        assert!(!Error::RelayUnreachable("down".to_string()).is_fatal());
    }

    #[test]
    fn test_call_failure_conversion() {
        assert!(matches!(
            Error::from(CallFailure::NegotiationTimeout),
            Error::NegotiationTimeout(_)
        ));
        assert!(matches!(
            Error::from(CallFailure::ChannelLost),
            Error::RelayUnreachable(_)
        ));
        assert!(matches!(
            Error::from(CallFailure::PeerUnavailable),
            Error::CallFailed(CallFailure::PeerUnavailable)
        ));
    }

    #[test]
    fn test_peer_absent_classification() {
        assert!(CallFailure::NegotiationTimeout.is_peer_absent());
        assert!(CallFailure::Rejected("busy".into()).is_peer_absent());
        assert!(CallFailure::Transport("no codec".into()).is_peer_absent());
        assert!(!CallFailure::ChannelLost.is_peer_absent());
        assert!(!CallFailure::ProtocolViolation("bad sdp".into()).is_peer_absent());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
        assert_eq!(err.kind(), FailureKind::RelayUnreachable);
    }
}
