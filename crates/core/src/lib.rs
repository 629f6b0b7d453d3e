//! pipectl core
//!
//! Registry of live media pipelines, the state-transition contract each
//! pipeline exposes, and the bridge that carries asynchronous engine events
//! into the single dispatch context that talks to clients.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          pipectl-core                             │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌──────────────┐   owns   ┌──────────────────┐  owns  ┌────────┐ │
//! │  │ ControlPlane │────────▶│ PipelineRegistry │──────▶│ Handle │ │
//! │  └──────┬───────┘          └──────────────────┘        └───┬────┘ │
//! │         │ admit()                                subscribe │      │
//! │         │                                                  ▼      │
//! │  ┌──────┴────────┐        ┌─────────────┐        ┌──────────────┐ │
//! │  │ EventReceiver │◀──────│ EventBridge │◀──────│ MediaEngine  │ │
//! │  │ (dispatch)    │  MPSC  └─────────────┘  sink  │ (own thread) │ │
//! │  └───────────────┘                               └──────────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipectl_core::{
//!     ControlPlane, PipelineRequest, SimulatedEngine, SimulatedTelemetry, StageSpec,
//! };
//!
//! let engine = Arc::new(SimulatedEngine::new()?);
//! let telemetry = Arc::new(SimulatedTelemetry::default());
//! let (mut control, mut events) = ControlPlane::new(engine, telemetry);
//!
//! let stages = vec![StageSpec::new("videotestsrc")];
//! control.create_pipeline(PipelineRequest::new(stages).with_id("p1"))?;
//! control.start_pipeline("p1")?;
//!
//! while let Some(envelope) = events.recv().await {
//!     if control.admit(&envelope) {
//!         // forward to clients
//!     }
//! }
//! ```

pub mod bridge;
pub mod control;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod state;
pub mod telemetry;

pub use bridge::{
    EventBridge, EventEnvelope, EventKind, EventPayload, EventReceiver, EventSink, Subscription,
    SubscriptionId,
};
pub use control::{ControlPlane, PipelineRequest};
pub use descriptor::{PipelineDescriptor, StageProperties, StageSpec};
pub use engine::simulated::SimulatedEngine;
pub use engine::{EngineEvent, EngineHandle, EventSource, MediaEngine};
pub use error::{EngineError, Error, ErrorCode, Result};
pub use handle::{PipelineHandle, PipelineSnapshot, StateSnapshot, StatusSnapshot};
pub use registry::PipelineRegistry;
pub use state::{PipelineState, StateChangeOutcome};
pub use telemetry::{PipelineStats, SimulatedTelemetry, TelemetryProvider};

#[cfg(feature = "gstreamer")]
pub use engine::gstreamer::GstEngine;
