//! Signaling payloads and the JSON-RPC 2.0 relay wire format

use crate::call::CallId;
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Relay method names
pub mod methods {
    /// Register an identity on the relay (client -> relay)
    pub const ANNOUNCE: &str = "peer.announce";
    /// Peer-to-peer signal (both directions)
    pub const SIGNAL: &str = "peer.signal";
    /// Recipient of a signal is not registered (relay -> client)
    pub const UNDELIVERABLE: &str = "peer.undeliverable";
    /// A peer this client exchanged signals with left (relay -> client)
    pub const LEFT: &str = "peer.left";
}

/// Standard JSON-RPC 2.0 error codes plus relay-specific ones
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Identity already held by another live connection
    pub const IDENTITY_TAKEN: i32 = -32010;

    /// Connection has not announced an identity yet
    pub const NOT_ANNOUNCED: i32 = -32011;
}

/// Message exchanged between two peers through the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Session description offer opening a call
    Offer {
        /// Call this offer opens
        call_id: CallId,
        /// Offer payload (SDP for WebRTC)
        sdp: String,
    },
    /// Session description answer accepting a call
    Answer {
        /// Call being answered
        call_id: CallId,
        /// Answer payload
        sdp: String,
    },
    /// Refusal of an offer
    Reject {
        /// Call being refused
        call_id: CallId,
        /// Human-readable reason
        reason: String,
    },
    /// Clean, remote-initiated close of a call
    Hangup {
        /// Call being closed
        call_id: CallId,
    },
}

impl SignalMessage {
    /// Call this message belongs to
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::Reject { call_id, .. }
            | SignalMessage::Hangup { call_id } => call_id,
        }
    }

    /// Get the message type name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Reject { .. } => "reject",
            SignalMessage::Hangup { .. } => "hangup",
        }
    }
}

/// JSON-RPC 2.0 request or notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Request ID (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 success response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: serde_json::Value,

    /// Request ID this response corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,
}

/// Any frame a relay client may receive
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcFrame {
    /// Request or notification
    Request(JsonRpcRequest),
    /// Success response
    Response(JsonRpcResponse),
    /// Error response
    Error(JsonRpcError),
}

/// Parameters for peer.announce
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnounceParams {
    /// Identity to register
    pub peer_id: String,
}

/// Parameters for peer.signal sent by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundSignalParams {
    /// Recipient identity
    pub to: String,
    /// Peer-to-peer payload
    pub payload: SignalMessage,
}

/// Parameters for peer.signal delivered by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundSignalParams {
    /// Sender identity
    pub from: String,
    /// Peer-to-peer payload
    pub payload: SignalMessage,
}

/// Parameters for peer.undeliverable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UndeliverableParams {
    /// Identity that is not registered
    pub to: String,
}

/// Parameters for peer.left
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeftParams {
    /// Identity whose connection closed
    pub peer_id: String,
}

impl JsonRpcRequest {
    /// Create a request with an id
    pub fn new(method: &str, params: serde_json::Value, id: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self::new(method, params, None)
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize JSON-RPC request: {}",
                e
            ))
        })
    }

    /// Decode the params into a typed struct
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            crate::Error::ProtocolViolation(format!("Invalid {} params: {}", self.method, e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC response: {}",
                e
            ))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: String, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject { code, message },
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}

impl JsonRpcFrame {
    /// Parse any relay frame
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::ProtocolViolation(format!("Unparseable relay frame: {}", e))
        })
    }
}
