//! Configuration types for broadcast and viewer sessions

use crate::supervisor::ReconnectionPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration shared by `BroadcastSession` and `ViewerSession`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// WebSocket relay URL (ws:// or wss://), used by `WsRelay::from_config`
    pub relay_url: String,

    /// Upper bound for establishing the relay connection and registering
    /// the local identity (default: 10000ms)
    pub relay_connect_timeout_ms: u64,

    /// Upper bound for offer/answer plus transport establishment
    /// (default: 15000ms). A `ViewerSession::start` settles within
    /// `relay_connect_timeout_ms + negotiation_timeout_ms`.
    pub negotiation_timeout_ms: u64,

    /// STUN server URLs handed to the media transport
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Capacity of the per-channel inbound event queue (default: 256)
    pub event_buffer: usize,

    /// Retry policy used by `ViewerSession::supervise` and
    /// `BroadcastSession::supervise`
    pub reconnect: ReconnectionPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080/ws".to_string(),
            relay_connect_timeout_ms: 10_000,
            negotiation_timeout_ms: 15_000,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            event_buffer: 256,
            reconnect: ReconnectionPolicy::default(),
        }
    }
}

impl BroadcastConfig {
    /// Relay connect timeout as a `Duration`
    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }

    /// Negotiation timeout as a `Duration`
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_url` is not a WebSocket URL
    /// - either timeout is zero
    /// - `event_buffer` is zero
    /// - the reconnection policy is inconsistent
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with ws:// or wss://, got {}",
                self.relay_url
            )));
        }

        if self.relay_connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "relay_connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig(
                "event_buffer must be greater than zero".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        self.reconnect.validate()
    }

    /// Parse a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Example
    ///
    /// ```
    /// use remotemedia_broadcast::BroadcastConfig;
    ///
    /// let config = BroadcastConfig::from_toml_str(r#"
    ///     relay_url = "wss://relay.example.com/ws"
    ///     negotiation_timeout_ms = 8000
    /// "#).unwrap();
    /// assert_eq!(config.negotiation_timeout_ms, 8000);
    /// assert_eq!(config.relay_connect_timeout_ms, 10_000);
    /// ```
    pub fn from_toml_str(source: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Preset for small events where viewers should learn quickly that the
    /// broadcast is not available
    ///
    /// # Example
    ///
    /// ```
    /// use remotemedia_broadcast::BroadcastConfig;
    ///
    /// let config = BroadcastConfig::low_latency_preset("ws://localhost:8080/ws");
    /// assert_eq!(config.negotiation_timeout_ms, 5000);
    /// ```
    pub fn low_latency_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            relay_connect_timeout_ms: 3000,
            negotiation_timeout_ms: 5000,
            reconnect: ReconnectionPolicy::aggressive(),
            ..Default::default()
        }
    }

    /// Preset for viewers that wait on a page until the broadcast starts
    ///
    /// Retries forever with the default capped backoff.
    pub fn patient_viewer_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            reconnect: ReconnectionPolicy {
                max_attempts: None,
                ..ReconnectionPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Override the negotiation timeout
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
