//! GStreamer backend
//!
//! Messages are taken off the bus with a sync handler, which runs on the
//! streaming thread that posted them, and pushed straight into the event
//! sink. No GLib main loop is needed.

use std::time::Duration;

use ::gstreamer as gst;
use ::gstreamer::prelude::*;

use super::{EngineEvent, EngineHandle, EventSource, MediaEngine};
use crate::bridge::EventSink;
use crate::error::EngineError;
use crate::state::{PipelineState, StateChangeOutcome};

/// How long `release` waits for the pipeline to reach NULL
pub const NULL_ACK_TIMEOUT_SECS: u64 = 5;

pub struct GstEngine;

impl GstEngine {
    /// Initialise GStreamer
    pub fn new() -> Result<Self, EngineError> {
        gst::init().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self)
    }
}

impl MediaEngine for GstEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn launch(
        &self,
        name: &str,
        launch_line: &str,
        events: EventSink,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        let pipeline = build_pipeline(name, launch_line)?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::Unavailable("pipeline has no bus".to_string()))?;

        let top = pipeline.downgrade();
        bus.set_sync_handler(move |_, msg| {
            let from_top = match (msg.src(), top.upgrade()) {
                (Some(src), Some(pipeline)) => src == pipeline.upcast_ref::<gst::Object>(),
                _ => false,
            };
            if let Some(event) = translate(msg, from_top) {
                events.emit(event);
            }
            gst::BusSyncReply::Drop
        });

        Ok(Box::new(GstHandle {
            pipeline,
            bus,
            released: false,
        }))
    }
}

/// Parse a launch line into a top-level pipeline named after the pipeline id
fn build_pipeline(name: &str, launch_line: &str) -> Result<gst::Pipeline, EngineError> {
    let element =
        gst::parse::launch(launch_line).map_err(|e| EngineError::Parse(e.to_string()))?;

    // A single-element launch line yields the element itself, not a bin
    match element.downcast::<gst::Pipeline>() {
        Ok(pipeline) => {
            pipeline.set_property("name", name);
            Ok(pipeline)
        }
        Err(element) => {
            let pipeline = gst::Pipeline::with_name(name);
            pipeline
                .add(&element)
                .map_err(|e| EngineError::Parse(e.to_string()))?;
            Ok(pipeline)
        }
    }
}

struct GstHandle {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
    released: bool,
}

impl EngineHandle for GstHandle {
    fn set_state(&mut self, target: PipelineState) -> Result<StateChangeOutcome, EngineError> {
        match self.pipeline.set_state(to_gst(target)) {
            Ok(gst::StateChangeSuccess::Success) => Ok(StateChangeOutcome::Success),
            Ok(gst::StateChangeSuccess::Async) => Ok(StateChangeOutcome::Async),
            Ok(gst::StateChangeSuccess::NoPreroll) => Ok(StateChangeOutcome::NoPreroll),
            Err(e) => Err(EngineError::StateChange {
                target: target.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn current_state(&self) -> PipelineState {
        from_gst(self.pipeline.current_state())
    }

    fn position(&self) -> Option<Duration> {
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(|t| Duration::from_nanos(t.nseconds()))
    }

    fn release(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.bus.unset_sync_handler();

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| EngineError::StateChange {
                target: PipelineState::Null.to_string(),
                reason: e.to_string(),
            })?;
        let (_, state, _) = self
            .pipeline
            .state(gst::ClockTime::from_seconds(NULL_ACK_TIMEOUT_SECS));
        if state != gst::State::Null {
            return Err(EngineError::StateChange {
                target: PipelineState::Null.to_string(),
                reason: format!("pipeline still in {:?}", state),
            });
        }
        Ok(())
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to release GStreamer pipeline on drop");
        }
    }
}

fn translate(msg: &gst::Message, from_top: bool) -> Option<EngineEvent> {
    let source = if from_top {
        EventSource::Pipeline
    } else {
        EventSource::Stage(
            msg.src()
                .map(|s| s.name().to_string())
                .unwrap_or_default(),
        )
    };

    match msg.view() {
        gst::MessageView::Error(err) => Some(EngineEvent::Error {
            source,
            message: err.error().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        }),
        gst::MessageView::Eos(_) => Some(EngineEvent::EndOfStream),
        gst::MessageView::StateChanged(sc) => Some(EngineEvent::StateChanged {
            source,
            old: from_gst(sc.old()),
            new: from_gst(sc.current()),
        }),
        _ => None,
    }
}

fn to_gst(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> PipelineState {
    match state {
        gst::State::Ready => PipelineState::Ready,
        gst::State::Paused => PipelineState::Paused,
        gst::State::Playing => PipelineState::Playing,
        _ => PipelineState::Null,
    }
}
