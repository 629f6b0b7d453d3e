//! Pipeline handle
//!
//! A [`PipelineHandle`] exclusively owns one engine pipeline and the event
//! subscription attached to it. Its operations are the only way a pipeline
//! changes state.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bridge::{EventBridge, Subscription, SubscriptionId};
use crate::descriptor::{PipelineDescriptor, StageSpec};
use crate::engine::{EngineHandle, MediaEngine};
use crate::error::{Error, Result};
use crate::state::PipelineState;
use crate::telemetry::{PipelineStats, TelemetryProvider};

/// Returned by a successful `create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub id: String,
    pub description: String,
    pub state: PipelineState,
    pub elements: Vec<StageSpec>,
}

/// Returned by `start`, `stop` and `delete`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub id: String,
    pub state: PipelineState,
    pub message: String,
}

/// Returned by `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub description: String,
    pub state: PipelineState,
    pub stats: PipelineStats,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One pipeline and its engine resources
pub struct PipelineHandle {
    id: String,
    description: String,
    descriptor: PipelineDescriptor,
    engine: Arc<dyn MediaEngine>,
    telemetry: Arc<dyn TelemetryProvider>,
    engine_handle: Option<Box<dyn EngineHandle>>,
    subscription: Option<Subscription>,
    last_known_state: PipelineState,
    last_error: Option<String>,
    stats: PipelineStats,
}

impl PipelineHandle {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        descriptor: PipelineDescriptor,
        engine: Arc<dyn MediaEngine>,
        telemetry: Arc<dyn TelemetryProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            descriptor,
            engine,
            telemetry,
            engine_handle: None,
            subscription: None,
            last_known_state: PipelineState::Null,
            last_error: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    /// True while an engine pipeline is held
    pub fn is_created(&self) -> bool {
        self.engine_handle.is_some()
    }

    /// Current event subscription, if events are still being forwarded
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription.as_ref().map(Subscription::id)
    }

    pub fn last_known_state(&self) -> PipelineState {
        self.last_known_state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Build the engine pipeline
    ///
    /// The subscription is opened and handed to the engine before the engine
    /// pipeline exists, so events raised immediately after construction are
    /// already routed through the bridge when this returns.
    pub fn create(&mut self, bridge: &EventBridge) -> Result<PipelineSnapshot> {
        if self.engine_handle.is_some() {
            return Err(Error::AlreadyExists(self.id.clone()));
        }

        let launch_line = self.descriptor.to_launch_line();
        info!(
            pipeline_id = %self.id,
            engine = self.engine.name(),
            launch_line = %launch_line,
            "Creating pipeline"
        );

        let (subscription, sink) = bridge.subscribe(&self.id);
        match self.engine.launch(&self.id, &launch_line, sink) {
            Ok(engine_handle) => {
                self.engine_handle = Some(engine_handle);
                self.subscription = Some(subscription);
                self.last_known_state = PipelineState::Null;
                self.last_error = None;
                Ok(PipelineSnapshot {
                    id: self.id.clone(),
                    description: self.description.clone(),
                    state: PipelineState::Null,
                    elements: self.descriptor.stages().to_vec(),
                })
            }
            Err(e) => {
                error!(pipeline_id = %self.id, error = %e, "Error creating pipeline");
                self.last_error = Some(e.to_string());
                Err(Error::CreationFailed(e.to_string()))
            }
        }
    }

    /// Request PLAYING
    pub fn start(&mut self) -> Result<StateSnapshot> {
        let engine_handle = self.engine_handle.as_mut().ok_or(Error::NotCreated)?;
        match engine_handle.set_state(PipelineState::Playing) {
            Ok(outcome) => {
                debug!(pipeline_id = %self.id, ?outcome, "Start requested");
                Ok(StateSnapshot {
                    id: self.id.clone(),
                    state: PipelineState::Playing,
                    message: "Pipeline started".to_string(),
                })
            }
            Err(e) => {
                error!(pipeline_id = %self.id, error = %e, "Failed to start pipeline");
                self.last_error = Some(e.to_string());
                Err(Error::StartFailed(e.to_string()))
            }
        }
    }

    /// Request PAUSED; resources stay allocated for a later resume
    pub fn stop(&mut self) -> Result<StateSnapshot> {
        let engine_handle = self.engine_handle.as_mut().ok_or(Error::NotCreated)?;
        match engine_handle.set_state(PipelineState::Paused) {
            Ok(outcome) => {
                debug!(pipeline_id = %self.id, ?outcome, "Pause requested");
                Ok(StateSnapshot {
                    id: self.id.clone(),
                    state: PipelineState::Paused,
                    message: "Pipeline paused".to_string(),
                })
            }
            Err(e) => {
                error!(pipeline_id = %self.id, error = %e, "Failed to pause pipeline");
                self.last_error = Some(e.to_string());
                Err(Error::StopFailed(e.to_string()))
            }
        }
    }

    /// Stop forwarding engine events for this pipeline
    pub fn cancel_events(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    /// Tear down: cancel events, drive the engine to NULL and drop it
    ///
    /// Idempotent; a deleted handle keeps answering with the NULL snapshot.
    pub fn delete(&mut self) -> StateSnapshot {
        self.cancel_events();

        if let Some(mut engine_handle) = self.engine_handle.take() {
            if let Err(e) = engine_handle.release() {
                warn!(pipeline_id = %self.id, error = %e, "Engine did not acknowledge NULL");
            }
            info!(pipeline_id = %self.id, "Pipeline deleted");
        }

        self.last_known_state = PipelineState::Null;
        self.stats = PipelineStats::default();

        StateSnapshot {
            id: self.id.clone(),
            state: PipelineState::Null,
            message: "Pipeline deleted".to_string(),
        }
    }

    /// Poll the engine for live state and recompute telemetry
    ///
    /// A failed telemetry query is returned as an error; the polled state is
    /// still recorded and the previous stats are kept.
    pub fn status(&mut self) -> Result<StatusSnapshot> {
        match &self.engine_handle {
            Some(engine_handle) => {
                let state = engine_handle.current_state();
                self.last_known_state = state;
                self.stats = self
                    .telemetry
                    .sample(&self.id, state, engine_handle.position())?;
            }
            None => {
                self.last_known_state = PipelineState::Null;
                self.stats = PipelineStats::default();
            }
        }
        Ok(self.cached_status())
    }

    /// Status from the last poll and the last admitted events, without touching the engine
    pub fn cached_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            id: self.id.clone(),
            description: self.description.clone(),
            state: self.last_known_state,
            stats: self.stats.clone(),
            error: self.last_error.clone(),
        }
    }

    /// Record a state reported asynchronously by the engine
    pub fn observe_state(&mut self, state: PipelineState) {
        self.last_known_state = state;
    }

    /// Record an asynchronous engine error; the state is left untouched
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.engine_handle.is_some() {
            self.delete();
        }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("created", &self.is_created())
            .field("last_known_state", &self.last_known_state)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::simulated::SimulatedEngine;
    use crate::error::EngineError;
    use crate::telemetry::SimulatedTelemetry;

    fn handle_for(stages: Vec<StageSpec>, engine: Arc<dyn MediaEngine>) -> PipelineHandle {
        PipelineHandle::new(
            "p1",
            "Pipeline p1",
            PipelineDescriptor::new(stages).unwrap(),
            engine,
            Arc::new(SimulatedTelemetry::default()),
        )
    }

    fn engine() -> Arc<dyn MediaEngine> {
        Arc::new(SimulatedEngine::new().unwrap())
    }

    #[test]
    fn test_create_reports_null_and_subscribes() {
        let (bridge, _rx) = EventBridge::new();
        let mut handle = handle_for(vec![StageSpec::new("videotestsrc")], engine());

        let snapshot = handle.create(&bridge).unwrap();
        assert_eq!(snapshot.state, PipelineState::Null);
        assert_eq!(snapshot.elements.len(), 1);
        assert!(handle.subscription_id().is_some());
        assert_eq!(handle.status().unwrap().state, PipelineState::Null);
    }

    #[test]
    fn test_create_failure_leaves_no_engine_handle() {
        let (bridge, _rx) = EventBridge::new();
        let mut handle = handle_for(vec![StageSpec::new("bogus")], engine());

        let err = handle.create(&bridge).unwrap_err();
        assert!(matches!(err, Error::CreationFailed(ref m) if m.contains("bogus")));
        assert!(!handle.is_created());
        assert!(handle.subscription_id().is_none());
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn test_operations_before_create_fail_not_created() {
        let mut handle = handle_for(vec![StageSpec::new("videotestsrc")], engine());

        assert!(matches!(handle.start(), Err(Error::NotCreated)));
        assert!(matches!(handle.stop(), Err(Error::NotCreated)));

        let status = handle.status().unwrap();
        assert_eq!(status.state, PipelineState::Null);
        assert!(status.stats.is_empty());
    }

    struct FailingTelemetry;

    impl TelemetryProvider for FailingTelemetry {
        fn sample(
            &self,
            _pipeline_id: &str,
            _state: PipelineState,
            _position: Option<std::time::Duration>,
        ) -> std::result::Result<PipelineStats, EngineError> {
            Err(EngineError::Telemetry("counter source offline".to_string()))
        }
    }

    #[test]
    fn test_telemetry_failure_is_reported_and_state_kept() {
        let (bridge, _rx) = EventBridge::new();
        let mut handle = PipelineHandle::new(
            "p1",
            "Pipeline p1",
            PipelineDescriptor::new(vec![StageSpec::new("videotestsrc")]).unwrap(),
            engine(),
            Arc::new(FailingTelemetry),
        );
        handle.create(&bridge).unwrap();
        handle.observe_state(PipelineState::Paused);

        let err = handle.status().unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::Telemetry(_))));
        let cached = handle.cached_status();
        assert_eq!(cached.state, PipelineState::Null);
        assert!(cached.stats.is_empty());
    }

    #[test]
    fn test_start_failure_is_reported() {
        let (bridge, _rx) = EventBridge::new();
        let mut handle = handle_for(
            vec![StageSpec::new("videotestsrc").with_property("simulate-fail", "start")],
            engine(),
        );
        handle.create(&bridge).unwrap();

        assert!(matches!(handle.start(), Err(Error::StartFailed(_))));
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (bridge, _rx) = EventBridge::new();
        let mut handle = handle_for(vec![StageSpec::new("videotestsrc")], engine());
        handle.create(&bridge).unwrap();
        handle.start().unwrap();

        let first = handle.delete();
        let second = handle.delete();
        assert_eq!(first, second);
        assert_eq!(first.state, PipelineState::Null);
        assert!(!handle.is_created());
        assert!(matches!(handle.start(), Err(Error::NotCreated)));
    }
}
