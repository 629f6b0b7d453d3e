//! WebSocket control transport for pipectl
//!
//! Lets many remote clients drive one shared set of media pipelines over a
//! path-gated WebSocket endpoint, and fans pipeline events and telemetry
//! out to every connected client.
//!
//! # Architecture
//!
//! ```text
//!   client ──ws──▶ connection task ──DispatchRequest──┐
//!   client ──ws──▶ connection task ──DispatchRequest──┤
//!                        ▲                            ▼
//!                        │ Outbound       ┌──────────────────────┐
//!                        └────────────────│ BroadcastDispatcher  │◀── EventReceiver
//!                                         │  ControlPlane        │    (engine events)
//!                                         │  ClientSet           │
//!                                         │  telemetry tick      │
//!                                         └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipectl_core::{ControlPlane, SimulatedEngine, SimulatedTelemetry};
//! use pipectl_ws::{ControlServer, ServerConfig};
//!
//! let (control, events) = ControlPlane::new(
//!     Arc::new(SimulatedEngine::new()?),
//!     Arc::new(SimulatedTelemetry::default()),
//! );
//! let server = ControlServer::bind(ServerConfig::default(), control, events).await?;
//! server.serve_with_shutdown(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use dispatcher::{
    BroadcastDispatcher, BroadcastReport, ClientId, ClientRegistration, ClientSet, DispatchRequest,
    DispatcherHandle, Outbound,
};
pub use error::{Error, Result};
pub use protocol::{ClientCommand, ServerMessage};
pub use server::ControlServer;
pub use session::SessionProtocolHandler;
