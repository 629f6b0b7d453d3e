//! Wire protocol
//!
//! Every message is a JSON object `{type, payload}`; outbound messages also
//! carry a millisecond `timestamp`. Inbound messages are parsed in two
//! stages: first the envelope, then the payload for the known `type`, so an
//! unknown type is distinguishable from a malformed payload. Both stages
//! read the original text, which keeps the order of stage properties.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipectl_core::{
    ErrorCode, EventEnvelope, EventPayload, PipelineRequest, PipelineSnapshot, PipelineState,
    PipelineStats, StageSpec, StateSnapshot, StatusSnapshot,
};

use crate::error::Result;

/// Inbound client command
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping,
    CreatePipeline(CreatePipelinePayload),
    StartPipeline { id: Option<String> },
    StopPipeline { id: Option<String> },
    DeletePipeline { id: Option<String> },
    GetPipelines,
    /// A well-formed envelope with a `type` this server does not handle
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    kind: String,
}

/// The same frame read again with a typed payload; `null` or absent means empty
#[derive(Debug, Deserialize)]
struct TypedCommand<T> {
    #[serde(default)]
    payload: Option<T>,
}

fn parse_payload<T: DeserializeOwned + Default>(text: &str) -> Result<T> {
    let typed: TypedCommand<T> = serde_json::from_str(text)?;
    Ok(typed.payload.unwrap_or_default())
}

/// Payload of `createPipeline`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreatePipelinePayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pipeline: PipelineSpec,
}

/// `{elements: [...]}` as sent by clients
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub elements: Vec<StageSpec>,
}

impl From<CreatePipelinePayload> for PipelineRequest {
    fn from(payload: CreatePipelinePayload) -> Self {
        PipelineRequest {
            id: payload.id,
            description: payload.description,
            elements: payload.pipeline.elements,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IdPayload {
    #[serde(default)]
    id: Option<String>,
}

impl ClientCommand {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawCommand = serde_json::from_str(text)?;

        let command = match raw.kind.as_str() {
            "ping" => ClientCommand::Ping,
            "getPipelines" => ClientCommand::GetPipelines,
            "createPipeline" => ClientCommand::CreatePipeline(parse_payload(text)?),
            "startPipeline" => ClientCommand::StartPipeline {
                id: parse_payload::<IdPayload>(text)?.id,
            },
            "stopPipeline" => ClientCommand::StopPipeline {
                id: parse_payload::<IdPayload>(text)?.id,
            },
            "deletePipeline" => ClientCommand::DeletePipeline {
                id: parse_payload::<IdPayload>(text)?.id,
            },
            _ => ClientCommand::Unknown(raw.kind),
        };
        Ok(command)
    }

    /// Wire name of the command, for logging
    pub fn kind(&self) -> &str {
        match self {
            ClientCommand::Ping => "ping",
            ClientCommand::CreatePipeline(_) => "createPipeline",
            ClientCommand::StartPipeline { .. } => "startPipeline",
            ClientCommand::StopPipeline { .. } => "stopPipeline",
            ClientCommand::DeletePipeline { .. } => "deletePipeline",
            ClientCommand::GetPipelines => "getPipelines",
            ClientCommand::Unknown(kind) => kind,
        }
    }
}

/// Outbound server message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    PipelinesList(PipelinesList),
    PipelineCreated(PipelineCreated),
    PipelineStateChanged(PipelineStateChanged),
    PipelineError(PipelineError),
    PipelineDeleted(PipelineDeleted),
    PipelineStats(PipelineStatsUpdate),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinesList {
    pub pipelines: Vec<StatusSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineCreated {
    pub pipeline: PipelineSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStateChanged {
    pub id: String,
    pub state: PipelineState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineError {
    /// `null` when the request named no pipeline
    pub id: Option<String>,
    pub error_code: ErrorCode,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDeleted {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatsUpdate {
    pub id: String,
    pub stats: PipelineStats,
}

impl ServerMessage {
    pub fn pipelines_list(pipelines: Vec<StatusSnapshot>) -> Self {
        ServerMessage::PipelinesList(PipelinesList { pipelines })
    }

    pub fn created(pipeline: PipelineSnapshot) -> Self {
        ServerMessage::PipelineCreated(PipelineCreated { pipeline })
    }

    pub fn state_changed(snapshot: StateSnapshot) -> Self {
        ServerMessage::PipelineStateChanged(PipelineStateChanged {
            id: snapshot.id,
            state: snapshot.state,
            message: snapshot.message,
        })
    }

    pub fn deleted(snapshot: StateSnapshot) -> Self {
        ServerMessage::PipelineDeleted(PipelineDeleted {
            id: snapshot.id,
            message: snapshot.message,
        })
    }

    pub fn stats(status: StatusSnapshot) -> Self {
        ServerMessage::PipelineStats(PipelineStatsUpdate {
            id: status.id,
            stats: status.stats,
        })
    }

    /// Error reply for a failed synchronous command
    pub fn error(id: Option<String>, err: &pipectl_core::Error) -> Self {
        ServerMessage::PipelineError(PipelineError {
            id,
            error_code: err.code(),
            error_message: err.to_string(),
            details: None,
        })
    }

    /// Client-facing form of an admitted engine event
    pub fn from_event(envelope: &EventEnvelope) -> Self {
        match &envelope.payload {
            EventPayload::Error {
                error_code,
                message,
                debug_details,
            } => ServerMessage::PipelineError(PipelineError {
                id: Some(envelope.pipeline_id.clone()),
                error_code: *error_code,
                error_message: message.clone(),
                details: debug_details.clone(),
            }),
            EventPayload::StateChanged { state, message } => {
                ServerMessage::PipelineStateChanged(PipelineStateChanged {
                    id: envelope.pipeline_id.clone(),
                    state: *state,
                    message: message.clone(),
                })
            }
        }
    }

    /// Wire name of the message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::PipelinesList(_) => "pipelinesList",
            ServerMessage::PipelineCreated(_) => "pipelineCreated",
            ServerMessage::PipelineStateChanged(_) => "pipelineStateChanged",
            ServerMessage::PipelineError(_) => "pipelineError",
            ServerMessage::PipelineDeleted(_) => "pipelineDeleted",
            ServerMessage::PipelineStats(_) => "pipelineStats",
            ServerMessage::Pong => "pong",
        }
    }

    /// Serialize with the given millisecond timestamp attached
    pub fn encode(&self, timestamp_ms: i64) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.insert("timestamp".to_string(), Value::from(timestamp_ms));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipectl_core::{EventKind, SubscriptionId};
    use serde_json::json;

    fn encode(message: &ServerMessage) -> Value {
        serde_json::from_str(&message.encode(1_700_000_000_000).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_create_pipeline() {
        let command = ClientCommand::parse(
            r#"{"type":"createPipeline","payload":{"id":"p1","pipeline":{"elements":[
                {"type":"videotestsrc","properties":{"pattern":"ball","is-live":true}},
                {"type":"fakesink"}
            ]}}}"#,
        )
        .unwrap();

        let ClientCommand::CreatePipeline(payload) = command else {
            panic!("expected createPipeline, got {:?}", command);
        };
        assert_eq!(payload.id.as_deref(), Some("p1"));
        assert!(payload.description.is_none());
        let elements = &payload.pipeline.elements;
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].stage_type, "videotestsrc");
        assert_eq!(elements[0].properties.get("is-live"), Some(&json!(true)));
        let names: Vec<&str> = elements[0].properties.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["pattern", "is-live"]);
    }

    #[test]
    fn test_missing_pipeline_yields_empty_elements() {
        let command =
            ClientCommand::parse(r#"{"type":"createPipeline","payload":{"id":"p1"}}"#).unwrap();
        let ClientCommand::CreatePipeline(payload) = command else {
            panic!("expected createPipeline");
        };
        assert!(PipelineRequest::from(payload).elements.is_empty());
    }

    #[test]
    fn test_missing_or_null_payload() {
        assert_eq!(ClientCommand::parse(r#"{"type":"ping"}"#).unwrap(), ClientCommand::Ping);
        assert_eq!(
            ClientCommand::parse(r#"{"type":"startPipeline","payload":null}"#).unwrap(),
            ClientCommand::StartPipeline { id: None }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"deletePipeline","payload":{"id":"p1"}}"#).unwrap(),
            ClientCommand::DeletePipeline {
                id: Some("p1".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"reboot","payload":{}}"#).unwrap(),
            ClientCommand::Unknown("reboot".to_string())
        );
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(ClientCommand::parse("not json").is_err());
        assert!(ClientCommand::parse(r#"{"payload":{}}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"stopPipeline","payload":{"id":7}}"#).is_err());
        assert!(ClientCommand::parse(
            r#"{"type":"createPipeline","payload":{"pipeline":{"elements":"x"}}}"#
        )
        .is_err());
    }

    #[test]
    fn test_pong_shape() {
        assert_eq!(
            encode(&ServerMessage::Pong),
            json!({"type": "pong", "timestamp": 1_700_000_000_000i64})
        );
    }

    #[test]
    fn test_error_reply_shape() {
        let message = ServerMessage::error(None, &pipectl_core::Error::NotFound(None));
        assert_eq!(
            encode(&message),
            json!({
                "type": "pipelineError",
                "payload": {
                    "id": null,
                    "errorCode": "not-found",
                    "errorMessage": "Pipeline not found",
                },
                "timestamp": 1_700_000_000_000i64,
            })
        );
    }

    #[test]
    fn test_deleted_shape() {
        let message = ServerMessage::deleted(StateSnapshot {
            id: "p1".to_string(),
            state: PipelineState::Null,
            message: "Pipeline deleted".to_string(),
        });
        assert_eq!(
            encode(&message)["payload"],
            json!({"id": "p1", "message": "Pipeline deleted"})
        );
    }

    #[test]
    fn test_engine_error_event_shape() {
        let envelope = EventEnvelope {
            pipeline_id: "p1".to_string(),
            subscription: dummy_subscription(),
            kind: EventKind::Error,
            payload: EventPayload::Error {
                error_code: ErrorCode::EngineError,
                message: "Internal data stream error".to_string(),
                debug_details: Some("not-linked".to_string()),
            },
            origin_timestamp_ms: 0,
        };

        assert_eq!(
            encode(&ServerMessage::from_event(&envelope))["payload"],
            json!({
                "id": "p1",
                "errorCode": "engine-error",
                "errorMessage": "Internal data stream error",
                "details": "not-linked",
            })
        );
    }

    #[test]
    fn test_stats_shape() {
        let message = ServerMessage::stats(StatusSnapshot {
            id: "p1".to_string(),
            description: "Pipeline p1".to_string(),
            state: PipelineState::Playing,
            stats: PipelineStats {
                latency: Some(150),
                ..Default::default()
            },
            error: None,
        });
        let value = encode(&message);
        assert_eq!(value["type"], "pipelineStats");
        assert_eq!(value["payload"], json!({"id": "p1", "stats": {"latency": 150}}));
    }

    fn dummy_subscription() -> SubscriptionId {
        let (bridge, _rx) = pipectl_core::EventBridge::new();
        bridge.subscribe("p1").0.id()
    }
}
