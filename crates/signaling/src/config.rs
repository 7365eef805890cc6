//! Configuration types for the relay server and the signaling client

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind the listener to (default: 0.0.0.0)
    pub bind_address: String,

    /// Listen port (default: 8080, 0 picks a free port)
    pub port: u16,

    /// Per-channel outbound queue capacity (default: 256)
    ///
    /// Deliveries that find the queue full are dropped.
    pub outbound_queue_capacity: usize,

    /// Maximum handle length in bytes (default: 64)
    pub max_handle_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            outbound_queue_capacity: 256,
            max_handle_len: 64,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bind_address` is empty
    /// - `outbound_queue_capacity` is 0
    /// - `max_handle_len` is 0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.bind_address.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "bind_address must not be empty".to_string(),
            ));
        }

        if self.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.max_handle_len == 0 {
            return Err(Error::InvalidConfig(
                "max_handle_len must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Bind to loopback on an OS-assigned port
    pub fn ephemeral() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    /// Set the listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Configuration for the client-side signaling connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs handed to the peer-connection primitive
    pub ice_servers: Vec<String>,

    /// Fixed delay before a reconnection attempt (default: 3000ms)
    pub reconnect_delay_ms: u64,

    /// Upper bound on consecutive reconnection attempts (default: 1, None = unbounded)
    pub max_reconnect_attempts: Option<u32>,

    /// Timeout for register/search round-trips (default: 10000ms)
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: Some(1),
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given relay URL
    pub fn new(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a WebSocket URL
    /// - `request_timeout_ms` is 0
    /// - `max_reconnect_attempts` is `Some(0)`
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.max_reconnect_attempts == Some(0) {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be None or at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay before a reconnection attempt
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Timeout for register/search round-trips
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Set the reconnection delay
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Bound the number of consecutive reconnection attempts
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Set the register/search timeout
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Replace the STUN server list
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}
