//! End-to-end tests against a real server on an ephemeral port
//!
//! Each test binds its own server with the simulated engine and talks to it
//! with tokio-tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pipectl_core::{ControlPlane, SimulatedEngine, SimulatedTelemetry};
use pipectl_ws::{ControlServer, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PATH: &str = "/pipelines";
const RECV_TIMEOUT: Duration = Duration::from_secs(3);
/// One default telemetry interval plus scheduling slack
const STATS_WINDOW: Duration = Duration::from_millis(1250);

struct TestServer {
    addr: SocketAddr,
    engine: Arc<SimulatedEngine>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<pipectl_ws::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let engine = Arc::new(SimulatedEngine::new().unwrap());
        let (control, events) =
            ControlPlane::new(engine.clone(), Arc::new(SimulatedTelemetry::default()));
        let server = ControlServer::bind(config, control, events).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with_shutdown(async {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            engine,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn connect(&self) -> Client {
        let (mut client, _) = connect_async(format!("ws://{}{}", self.addr, PATH))
            .await
            .unwrap();
        let snapshot = recv(&mut client).await;
        assert_eq!(snapshot["type"], "pipelinesList");
        client
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn send(client: &mut Client, message: Value) {
    client.send(Message::Text(message.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Next message of the given type, skipping everything else (stats, events)
async fn recv_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = recv(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

async fn create(client: &mut Client, id: &str) -> Value {
    send(
        client,
        json!({
            "type": "createPipeline",
            "payload": {
                "id": id,
                "pipeline": {"elements": [
                    {"type": "videotestsrc", "properties": {"is-live": true}},
                    {"type": "fakesink"}
                ]}
            }
        }),
    )
    .await;
    recv_type(client, "pipelineCreated").await
}

fn pipeline_ids(list: &Value) -> Vec<String> {
    list["payload"]["pipelines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_connect_receives_pipeline_list() {
    let server = TestServer::start().await;
    let (mut client, _) = connect_async(format!("ws://{}{}", server.addr, PATH))
        .await
        .unwrap();

    let snapshot = recv(&mut client).await;
    assert_eq!(snapshot["type"], "pipelinesList");
    assert_eq!(snapshot["payload"]["pipelines"], json!([]));
    assert!(snapshot["timestamp"].is_i64());

    server.stop().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    send(&mut client, json!({"type": "ping", "payload": {}})).await;
    let pong = recv(&mut client).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());

    server.stop().await;
}

#[tokio::test]
async fn test_create_reports_null_state() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let created = create(&mut client, "p1").await;
    assert_eq!(created["payload"]["pipeline"]["id"], "p1");
    assert_eq!(created["payload"]["pipeline"]["state"], "NULL");
    assert_eq!(created["payload"]["pipeline"]["description"], "Pipeline p1");

    send(&mut client, json!({"type": "getPipelines", "payload": {}})).await;
    let list = recv_type(&mut client, "pipelinesList").await;
    assert_eq!(pipeline_ids(&list), vec!["p1"]);
    assert_eq!(list["payload"]["pipelines"][0]["state"], "NULL");

    server.stop().await;
}

#[tokio::test]
async fn test_empty_elements_is_invalid_pipeline() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    send(
        &mut client,
        json!({"type": "createPipeline", "payload": {"id": "p1", "pipeline": {"elements": []}}}),
    )
    .await;
    let error = recv_type(&mut client, "pipelineError").await;
    assert_eq!(error["payload"]["errorCode"], "invalid-pipeline");

    send(&mut client, json!({"type": "getPipelines"})).await;
    let list = recv_type(&mut client, "pipelinesList").await;
    assert!(pipeline_ids(&list).is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_stage_is_creation_failed() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    send(
        &mut client,
        json!({"type": "createPipeline", "payload": {"id": "p1", "pipeline": {"elements": [{"type": "nosuchsrc"}]}}}),
    )
    .await;
    let error = recv_type(&mut client, "pipelineError").await;
    assert_eq!(error["payload"]["id"], "p1");
    assert_eq!(error["payload"]["errorCode"], "creation-failed");

    server.stop().await;
}

#[tokio::test]
async fn test_start_unknown_pipeline_is_not_found() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    send(&mut client, json!({"type": "startPipeline", "payload": {"id": "ghost"}})).await;
    let error = recv(&mut client).await;
    assert_eq!(error["type"], "pipelineError");
    assert_eq!(error["payload"]["id"], "ghost");
    assert_eq!(error["payload"]["errorCode"], "not-found");

    send(&mut client, json!({"type": "stopPipeline", "payload": {}})).await;
    let error = recv(&mut client).await;
    assert_eq!(error["payload"]["id"], Value::Null);
    assert_eq!(error["payload"]["errorCode"], "not-found");

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_create_is_already_exists() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    create(&mut client, "p1").await;
    send(
        &mut client,
        json!({"type": "createPipeline", "payload": {"id": "p1", "pipeline": {"elements": [{"type": "fakesrc"}]}}}),
    )
    .await;
    let error = recv_type(&mut client, "pipelineError").await;
    assert_eq!(error["payload"]["errorCode"], "already-exists");

    server.stop().await;
}

#[tokio::test]
async fn test_start_broadcasts_ordered_state_changes() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    create(&mut client, "p1").await;

    send(&mut client, json!({"type": "startPipeline", "payload": {"id": "p1"}})).await;

    let mut engine_states = Vec::new();
    let mut acknowledged = false;
    while engine_states.last().map(String::as_str) != Some("PLAYING") {
        let message = recv_type(&mut client, "pipelineStateChanged").await;
        let payload = &message["payload"];
        assert_eq!(payload["id"], "p1");
        if payload["message"] == "Pipeline started" {
            acknowledged = true;
            continue;
        }
        engine_states.push(payload["state"].as_str().unwrap().to_string());
    }

    assert!(acknowledged);
    assert_eq!(engine_states, vec!["READY", "PAUSED", "PLAYING"]);

    server.stop().await;
}

#[tokio::test]
async fn test_stats_reach_every_client() {
    let server = TestServer::start().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    create(&mut first, "p1").await;
    send(&mut first, json!({"type": "startPipeline", "payload": {"id": "p1"}})).await;

    for client in [&mut first, &mut second] {
        // The engine's own PLAYING event, not the start acknowledgement
        loop {
            let change = recv_type(client, "pipelineStateChanged").await;
            let payload = &change["payload"];
            if payload["state"] == "PLAYING" && payload["message"] != "Pipeline started" {
                break;
            }
        }
        let stats = tokio::time::timeout(STATS_WINDOW, recv_type(client, "pipelineStats"))
            .await
            .expect("no stats within one telemetry interval of PLAYING");
        assert_eq!(stats["payload"]["id"], "p1");
        assert_eq!(stats["payload"]["stats"]["bitrate"], 2_500_000);
        assert_eq!(stats["payload"]["stats"]["latency"], 150);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_engine_errors_are_broadcast() {
    let server = TestServer::start().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;
    create(&mut first, "p1").await;

    server
        .engine
        .inject_error("p1", "Internal data stream error", Some("reason not-negotiated"))
        .unwrap();

    for client in [&mut first, &mut second] {
        let error = recv_type(client, "pipelineError").await;
        assert_eq!(error["payload"]["id"], "p1");
        assert_eq!(error["payload"]["errorCode"], "engine-error");
        assert_eq!(error["payload"]["errorMessage"], "Internal data stream error");
        assert_eq!(error["payload"]["details"], "reason not-negotiated");
    }

    send(&mut first, json!({"type": "getPipelines"})).await;
    let list = recv_type(&mut first, "pipelinesList").await;
    assert_eq!(list["payload"]["pipelines"][0]["lastError"], "Internal data stream error");

    server.stop().await;
}

#[tokio::test]
async fn test_end_of_stream_is_reported_as_null() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    create(&mut client, "p1").await;

    server.engine.inject_eos("p1").unwrap();
    let message = recv_type(&mut client, "pipelineStateChanged").await;
    assert_eq!(message["payload"]["state"], "NULL");
    assert_eq!(message["payload"]["message"], "End of stream");

    server.stop().await;
}

#[tokio::test]
async fn test_delete_removes_pipeline_and_is_idempotent() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    create(&mut client, "p1").await;

    for _ in 0..2 {
        send(&mut client, json!({"type": "deletePipeline", "payload": {"id": "p1"}})).await;
        let deleted = recv_type(&mut client, "pipelineDeleted").await;
        assert_eq!(deleted["payload"], json!({"id": "p1", "message": "Pipeline deleted"}));
    }

    send(&mut client, json!({"type": "getPipelines", "payload": {}})).await;
    let list = recv_type(&mut client, "pipelinesList").await;
    assert!(!pipeline_ids(&list).contains(&"p1".to_string()));

    send(&mut client, json!({"type": "startPipeline", "payload": {"id": "p1"}})).await;
    let error = recv_type(&mut client, "pipelineError").await;
    assert_eq!(error["payload"]["errorCode"], "not-found");

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_messages_keep_connection_open() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(Message::Text("not json".to_string())).await.unwrap();
    send(&mut client, json!({"payload": {}})).await;
    send(&mut client, json!({"type": "reboot", "payload": {}})).await;
    send(&mut client, json!({"type": "ping"})).await;

    // Nothing was answered before the pong
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "pong");

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let server = TestServer::start().await;

    let err = connect_async(format!("ws://{}/elsewhere", server.addr))
        .await
        .err()
        .unwrap();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 404),
        other => panic!("expected an HTTP rejection, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_disconnected_client_does_not_block_others() {
    let server = TestServer::start().await;
    let mut survivor = server.connect().await;
    let dropped = server.connect().await;
    drop(dropped);

    create(&mut survivor, "p1").await;
    send(&mut survivor, json!({"type": "startPipeline", "payload": {"id": "p1"}})).await;
    let stats = recv_type(&mut survivor, "pipelineStats").await;
    assert_eq!(stats["payload"]["id"], "p1");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    create(&mut client, "p1").await;

    server.stop().await;

    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
