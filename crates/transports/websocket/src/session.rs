//! Session protocol handler
//!
//! Maps client commands onto control plane operations and results onto
//! outbound messages. Replies go only to the requesting client; the
//! dispatcher decides who receives what.

use tracing::{debug, warn};

use pipectl_core::{ControlPlane, Error, EventEnvelope, PipelineRequest};

use crate::protocol::{ClientCommand, ServerMessage};

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionProtocolHandler;

impl SessionProtocolHandler {
    pub fn new() -> Self {
        Self
    }

    /// First message a new client receives
    pub fn on_connect(&self, control: &mut ControlPlane) -> ServerMessage {
        ServerMessage::pipelines_list(control.list_pipelines())
    }

    /// Run one command to completion; `None` means no reply is sent
    pub fn handle(
        &self,
        control: &mut ControlPlane,
        command: ClientCommand,
    ) -> Option<ServerMessage> {
        let reply = match command {
            ClientCommand::Ping => ServerMessage::Pong,
            ClientCommand::GetPipelines => ServerMessage::pipelines_list(control.list_pipelines()),
            ClientCommand::CreatePipeline(payload) => {
                // Failures are tagged with the id, generated ones included
                let id = control.assign_id(payload.id.clone());
                let request = PipelineRequest::from(payload).with_id(id.clone());
                match control.create_pipeline(request) {
                    Ok(snapshot) => ServerMessage::created(snapshot),
                    Err(e) => {
                        warn!(pipeline_id = %id, error = %e, "Create pipeline failed");
                        ServerMessage::error(Some(id), &e)
                    }
                }
            }
            ClientCommand::StartPipeline { id } => with_id(id, |id| {
                control.start_pipeline(id).map(ServerMessage::state_changed)
            }),
            ClientCommand::StopPipeline { id } => with_id(id, |id| {
                control.stop_pipeline(id).map(ServerMessage::state_changed)
            }),
            ClientCommand::DeletePipeline { id } => with_id(id, |id| {
                control.delete_pipeline(id).map(ServerMessage::deleted)
            }),
            ClientCommand::Unknown(kind) => {
                warn!(kind = %kind, "Unknown message type");
                return None;
            }
        };
        Some(reply)
    }

    /// Client-facing message for an engine event, if it is still relevant
    pub fn on_event(
        &self,
        control: &mut ControlPlane,
        envelope: &EventEnvelope,
    ) -> Option<ServerMessage> {
        if !control.admit(envelope) {
            return None;
        }
        debug!(
            pipeline_id = %envelope.pipeline_id,
            kind = ?envelope.kind,
            "Forwarding engine event"
        );
        Some(ServerMessage::from_event(envelope))
    }
}

/// Run an id-addressed operation; a missing id is `not-found` with `id: null`
fn with_id<F>(id: Option<String>, op: F) -> ServerMessage
where
    F: FnOnce(&str) -> pipectl_core::Result<ServerMessage>,
{
    let Some(id) = id else {
        return ServerMessage::error(None, &Error::NotFound(None));
    };
    match op(&id) {
        Ok(message) => message,
        Err(e) => {
            debug!(pipeline_id = %id, error = %e, "Pipeline operation failed");
            ServerMessage::error(Some(id), &e)
        }
    }
}
