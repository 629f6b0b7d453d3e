//! Error types for the WebSocket control transport

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport layer
///
/// Pipeline operation failures are not errors at this level; they are
/// reported to clients as `pipelineError` messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket I/O failure (bind, accept, local address)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket handshake or framing failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A control plane query failed outside any client request
    #[error("Control plane error: {0}")]
    Control(#[from] pipectl_core::Error),

    /// The dispatcher has stopped and no longer accepts requests
    #[error("Dispatcher stopped")]
    DispatcherStopped,
}
