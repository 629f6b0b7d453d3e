//! Control plane facade
//!
//! [`ControlPlane`] bundles the registry with the collaborators every
//! pipeline needs (engine, telemetry provider, event bridge). It is owned by
//! the dispatch context; nothing here is shared with engine threads except
//! the bridge's producer side.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridge::{EventBridge, EventEnvelope, EventPayload, EventReceiver};
use crate::descriptor::{PipelineDescriptor, StageSpec};
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::handle::{PipelineHandle, PipelineSnapshot, StateSnapshot, StatusSnapshot};
use crate::registry::PipelineRegistry;
use crate::telemetry::TelemetryProvider;

/// Parameters of a create request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineRequest {
    /// Requested id; generated when absent
    pub id: Option<String>,
    /// Human label; `Pipeline <id>` when absent
    pub description: Option<String>,
    pub elements: Vec<StageSpec>,
}

impl PipelineRequest {
    pub fn new(elements: Vec<StageSpec>) -> Self {
        Self {
            elements,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub struct ControlPlane {
    registry: PipelineRegistry,
    engine: Arc<dyn MediaEngine>,
    telemetry: Arc<dyn TelemetryProvider>,
    bridge: EventBridge,
    engine_stopped: bool,
}

impl ControlPlane {
    /// Create a control plane and the consumer end of its event bridge
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        telemetry: Arc<dyn TelemetryProvider>,
    ) -> (Self, EventReceiver) {
        let (bridge, events) = EventBridge::new();
        info!(engine = engine.name(), "Control plane ready");
        (
            Self {
                registry: PipelineRegistry::new(),
                engine,
                telemetry,
                bridge,
                engine_stopped: false,
            },
            events,
        )
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// The id a create request will run under: the requested one, or a fresh
    /// `pipeline-<ms>` id that no registered pipeline uses
    ///
    /// Callers that need to tag a failed create with its id resolve it here
    /// and pass it on with [`PipelineRequest::with_id`].
    pub fn assign_id(&self, requested: Option<String>) -> String {
        requested.unwrap_or_else(|| self.generate_id())
    }

    /// Validate, build and register a pipeline
    ///
    /// The id is checked for uniqueness and the descriptor validated before
    /// the engine is touched. A pipeline that fails to build is never
    /// registered.
    pub fn create_pipeline(&mut self, request: PipelineRequest) -> Result<PipelineSnapshot> {
        let id = self.assign_id(request.id);
        if self.registry.contains(&id) {
            return Err(Error::AlreadyExists(id));
        }
        let descriptor = PipelineDescriptor::new(request.elements)?;
        let description = request
            .description
            .unwrap_or_else(|| format!("Pipeline {}", id));

        let mut handle = PipelineHandle::new(
            id,
            description,
            descriptor,
            Arc::clone(&self.engine),
            Arc::clone(&self.telemetry),
        );
        let snapshot = handle.create(&self.bridge)?;

        if let Err((err, mut rejected)) = self.registry.register(handle) {
            rejected.delete();
            return Err(err);
        }

        info!(
            pipeline_id = %snapshot.id,
            stages = snapshot.elements.len(),
            "Pipeline created"
        );
        Ok(snapshot)
    }

    pub fn start_pipeline(&mut self, id: &str) -> Result<StateSnapshot> {
        let snapshot = self.registry.lookup_mut(id)?.start()?;
        info!(pipeline_id = %id, "Pipeline start requested");
        Ok(snapshot)
    }

    pub fn stop_pipeline(&mut self, id: &str) -> Result<StateSnapshot> {
        let snapshot = self.registry.lookup_mut(id)?.stop()?;
        info!(pipeline_id = %id, "Pipeline pause requested");
        Ok(snapshot)
    }

    /// Tear down and forget a pipeline; repeated deletes are answered with the same snapshot
    pub fn delete_pipeline(&mut self, id: &str) -> Result<StateSnapshot> {
        self.registry.remove(id)
    }

    /// Statuses of all pipelines in creation order
    pub fn list_pipelines(&mut self) -> Vec<StatusSnapshot> {
        self.registry.list_statuses()
    }

    pub fn pipeline_status(&mut self, id: &str) -> Result<StatusSnapshot> {
        self.registry.lookup_mut(id)?.status()
    }

    /// Live statuses of the pipelines that are currently PLAYING
    pub fn playing_statuses(&mut self) -> Result<Vec<StatusSnapshot>> {
        self.registry.playing_statuses()
    }

    /// Decide whether an event envelope may reach clients
    ///
    /// Envelopes whose subscription is no longer the live one for their
    /// pipeline (deleted, or deleted and recreated under the same id) are
    /// rejected. Admitted envelopes update the handle's advisory fields.
    pub fn admit(&mut self, envelope: &EventEnvelope) -> bool {
        if !self
            .registry
            .is_current_subscription(&envelope.pipeline_id, envelope.subscription)
        {
            debug!(
                pipeline_id = %envelope.pipeline_id,
                subscription = %envelope.subscription,
                kind = ?envelope.kind,
                "Discarding event from stale subscription"
            );
            return false;
        }

        let Ok(handle) = self.registry.lookup_mut(&envelope.pipeline_id) else {
            return false;
        };
        match &envelope.payload {
            EventPayload::StateChanged { state, .. } => handle.observe_state(*state),
            EventPayload::Error { message, .. } => {
                warn!(
                    pipeline_id = %envelope.pipeline_id,
                    error = %message,
                    "Engine reported an error"
                );
                handle.record_error(message.clone());
            }
        }
        true
    }

    /// Delete every pipeline, returning their final snapshots
    pub fn delete_all(&mut self) -> Vec<StateSnapshot> {
        let deleted = self.registry.drain();
        if !deleted.is_empty() {
            info!(count = deleted.len(), "Deleted all pipelines");
        }
        deleted
    }

    /// Delete every pipeline, then stop the engine's scheduling context
    pub fn shutdown(&mut self) {
        self.delete_all();
        if !self.engine_stopped {
            self.engine_stopped = true;
            self.engine.shutdown();
            info!(engine = self.engine.name(), "Engine stopped");
        }
    }

    fn generate_id(&self) -> String {
        let base = format!("pipeline-{}", chrono::Utc::now().timestamp_millis());
        if !self.registry.contains(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.registry.contains(candidate))
            .unwrap_or(base)
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("engine", &self.engine.name())
            .field("registry", &self.registry)
            .finish()
    }
}
