//! Configuration for HAPI
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HapiError, Result};

/// Environment variable holding the broker URL
pub const ENV_BROKER_URL: &str = "HAPI_BROKER_URL";

/// Environment variable holding the queue address
pub const ENV_QUEUE_ADDR: &str = "HAPI_QUEUE_ADDR";

/// Command-line option carrying the queue address
pub const QUEUE_ADDR_OPTION: &str = "hapi-queue-addr";

/// Broker URL used when nothing else is configured
pub const DEFAULT_BROKER_URL: &str = "localhost:5672";

/// Conventional queue address for a monitoring server
pub fn default_queue_address(server_id: u32) -> String {
    format!("hap-pipe-{}", server_id)
}

/// Which side of the protocol an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Mints handshake keys and drives initiation.
    Server,
    /// Answers initiation; may ask the server to (re)initiate.
    Plugin,
}

/// Main configuration for a HAPI endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Broker Configuration
    // -------------------------------------------------------------------------
    /// Broker URL (opaque to the core)
    pub broker_url: String,

    /// Queue address shared by one server/plugin pair
    pub queue_address: String,

    /// Protocol side this endpoint plays
    pub role: Role,

    // -------------------------------------------------------------------------
    // Session Configuration
    // -------------------------------------------------------------------------
    /// How long to wait for the peer's half of the handshake (milliseconds)
    pub handshake_timeout_ms: u64,

    /// Receive loop wake-up interval (milliseconds)
    pub receive_poll_ms: u64,

    /// Delay before retrying a failed connection or handshake (milliseconds)
    pub reconnect_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            queue_address: String::new(),
            role: Role::Plugin,
            handshake_timeout_ms: 30_000,
            receive_poll_ms: 100,
            reconnect_interval_ms: 10_000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `HAPI_BROKER_URL` and `HAPI_QUEUE_ADDR`
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(url) = std::env::var(ENV_BROKER_URL) {
            config.broker_url = url;
        }
        if let Ok(addr) = std::env::var(ENV_QUEUE_ADDR) {
            config.queue_address = addr;
        }
        config
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.broker_url.is_empty() {
            return Err(HapiError::Config("broker url is empty".to_string()));
        }
        if self.receive_poll_ms == 0 {
            return Err(HapiError::Config("receive_poll_ms must be > 0".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(HapiError::Config("handshake_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the broker URL
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    /// Set the queue address
    pub fn queue_address(mut self, addr: impl Into<String>) -> Self {
        self.config.queue_address = addr.into();
        self
    }

    /// Use the conventional queue address for `server_id`
    pub fn server_id(mut self, server_id: u32) -> Self {
        self.config.queue_address = default_queue_address(server_id);
        self
    }

    /// Set the protocol role
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Set the handshake timeout (in milliseconds)
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.config.handshake_timeout_ms = ms;
        self
    }

    /// Set the receive loop poll interval (in milliseconds)
    pub fn receive_poll_ms(mut self, ms: u64) -> Self {
        self.config.receive_poll_ms = ms;
        self
    }

    /// Set the reconnect interval (in milliseconds)
    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_interval_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
