//! Error types for the pipectl control plane

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by synchronous pipeline operations
#[derive(Debug, Error)]
pub enum Error {
    /// The pipeline descriptor has no stages
    #[error("No pipeline elements provided")]
    InvalidPipeline,

    /// The engine rejected the descriptor
    #[error("{0}")]
    CreationFailed(String),

    /// Operation on a handle that holds no engine object
    #[error("Pipeline not created")]
    NotCreated,

    /// The engine rejected the PLAYING transition
    #[error("Failed to start pipeline: {0}")]
    StartFailed(String),

    /// The engine rejected the PAUSED transition
    #[error("Failed to pause pipeline: {0}")]
    StopFailed(String),

    /// Unknown pipeline id
    #[error("Pipeline not found")]
    NotFound(Option<String>),

    /// Duplicate pipeline id
    #[error("Pipeline {0} already exists")]
    AlreadyExists(String),

    /// Any other engine failure
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl Error {
    /// Wire-level error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidPipeline => ErrorCode::InvalidPipeline,
            Error::CreationFailed(_) => ErrorCode::CreationFailed,
            Error::NotCreated => ErrorCode::NotCreated,
            Error::StartFailed(_) => ErrorCode::StartFailed,
            Error::StopFailed(_) => ErrorCode::StopFailed,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::Engine(_) => ErrorCode::EngineError,
        }
    }
}

/// Error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    CreationFailed,
    NotCreated,
    StartFailed,
    StopFailed,
    NotFound,
    AlreadyExists,
    InvalidPipeline,
    /// Asynchronous failure raised by the engine after creation
    EngineError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CreationFailed => "creation-failed",
            ErrorCode::NotCreated => "not-created",
            ErrorCode::StartFailed => "start-failed",
            ErrorCode::StopFailed => "stop-failed",
            ErrorCode::NotFound => "not-found",
            ErrorCode::AlreadyExists => "already-exists",
            ErrorCode::InvalidPipeline => "invalid-pipeline",
            ErrorCode::EngineError => "engine-error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by a media engine backend
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The launch line could not be parsed or an element could not be built
    #[error("{0}")]
    Parse(String),

    /// The engine refused a state transition
    #[error("state change to {target} failed: {reason}")]
    StateChange { target: String, reason: String },

    /// The engine (or its scheduler) is no longer running
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// A telemetry counter query failed
    #[error("telemetry query failed: {0}")]
    Telemetry(String),
}
