//! Media engine interface
//!
//! The engine is an external collaborator: it builds element graphs from a
//! launch line, runs them on its own threads and reports events
//! asynchronously. The control plane only talks to it through
//! [`MediaEngine`] and [`EngineHandle`].
//!
//! Backends:
//! - [`simulated::SimulatedEngine`]: in-process engine with its own scheduler
//!   thread, used by default and by the tests
//! - `gstreamer::GstEngine`: GStreamer backend (feature `gstreamer`)

use std::time::Duration;

use crate::bridge::EventSink;
use crate::error::EngineError;
use crate::state::{PipelineState, StateChangeOutcome};

#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod simulated;

/// Origin of an engine message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    /// The top-level pipeline object
    Pipeline,
    /// An internal stage, by element name
    Stage(String),
}

/// Events raised on the engine's execution context
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Error {
        source: EventSource,
        message: String,
        debug: Option<String>,
    },
    EndOfStream,
    StateChanged {
        source: EventSource,
        old: PipelineState,
        new: PipelineState,
    },
}

/// Factory for engine pipelines
pub trait MediaEngine: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Build a pipeline from its launch line
    ///
    /// `events` must be attached to the pipeline's event source before this
    /// returns, so that nothing raised right after construction is lost.
    fn launch(
        &self,
        name: &str,
        launch_line: &str,
        events: EventSink,
    ) -> Result<Box<dyn EngineHandle>, EngineError>;

    /// Stop the engine's own scheduler. Called last during shutdown.
    fn shutdown(&self) {}
}

/// One running engine pipeline
pub trait EngineHandle: Send {
    /// Request a state; the result reflects acceptance, not settlement
    fn set_state(&mut self, target: PipelineState) -> Result<StateChangeOutcome, EngineError>;

    /// Current (settled) state as the engine sees it
    fn current_state(&self) -> PipelineState;

    /// Stream position, when the engine can answer
    fn position(&self) -> Option<Duration>;

    /// Detach the event source, drive the pipeline to NULL and wait for the
    /// engine to acknowledge it
    fn release(&mut self) -> Result<(), EngineError>;
}
