//! Viewer and broadcast sessions
//!
//! Each session owns exactly one signaling channel at a time and publishes
//! its state through a `tokio::sync::watch` channel.

mod broadcast;
mod viewer;

pub use broadcast::{
    AcceptAll, Admission, AdmissionPolicy, BroadcastSession, BroadcastState, ViewerInfo,
};
pub use viewer::{ViewerOutcome, ViewerSession, ViewerState};

use crate::error::FailureKind;
use crate::Error;
use std::fmt;

/// Failure recorded by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Classification used for retry decisions
    pub kind: FailureKind,
    /// Human-readable detail
    pub detail: String,
}

impl SessionError {
    /// Create a session error
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<&Error> for SessionError {
    fn from(error: &Error) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}
