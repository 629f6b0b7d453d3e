//! Server configuration
//!
//! Configuration can be loaded from a TOML file; every field has a default so
//! a partial file (or none at all) is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// WebSocket control server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request path of the WebSocket endpoint; other paths get a 404
    #[serde(default = "default_path")]
    pub path: String,

    /// Telemetry polling period
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_ms: u64,

    /// Pause after a failed telemetry iteration
    #[serde(default = "default_telemetry_error_backoff")]
    pub telemetry_error_backoff_ms: u64,

    /// Keepalive ping period
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// How long past a ping a client may stay silent before it is dropped
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Largest accepted inbound message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound messages buffered per client before it counts as broken
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/pipelines".to_string()
}

fn default_telemetry_interval() -> u64 {
    1000
}

fn default_telemetry_error_backoff() -> u64 {
    5000
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_client_queue_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            telemetry_interval_ms: default_telemetry_interval(),
            telemetry_error_backoff_ms: default_telemetry_error_backoff(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            max_message_size: default_max_message_size(),
            client_queue_capacity: default_client_queue_capacity(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::Config(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.telemetry_interval_ms == 0 || self.telemetry_error_backoff_ms == 0 {
            return Err(Error::Config("telemetry intervals must be non-zero".to_string()));
        }
        if self.ping_interval_secs == 0 || self.ping_timeout_secs == 0 {
            return Err(Error::Config("keepalive intervals must be non-zero".to_string()));
        }
        if self.client_queue_capacity == 0 {
            return Err(Error::Config("client_queue_capacity must be non-zero".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be non-zero".to_string()));
        }
        Ok(())
    }

    /// `host:port` for the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn telemetry_error_backoff(&self) -> Duration {
        Duration::from_millis(self.telemetry_error_backoff_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Whether a handshake request path addresses the endpoint
    ///
    /// An empty request path is accepted when the endpoint is `/`.
    pub fn accepts_path(&self, request_path: &str) -> bool {
        request_path == self.path || (self.path == "/" && request_path.is_empty())
    }
}
