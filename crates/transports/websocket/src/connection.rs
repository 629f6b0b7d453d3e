//! Per-connection task
//!
//! Performs the path-gated handshake, registers the client with the
//! dispatcher, then shuttles frames: inbound text goes to the dispatcher,
//! outbound messages from the dispatcher go to the socket. Keepalive pings
//! are sent on a fixed period and the connection is dropped when a ping goes
//! unanswered.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{DispatcherHandle, Outbound};
use crate::error::Result;

/// Handle a single WebSocket connection until either side closes it
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: DispatcherHandle,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let path_filter = |request: &Request, response: Response| {
        let request_path = request.uri().path();
        if config.accepts_path(request_path) {
            return Ok(response);
        }
        warn!(
            peer = %peer_addr,
            path = %request_path,
            "Rejected WebSocket connection to invalid path"
        );
        Err(not_found(&config.path))
    };

    let ws_stream =
        accept_hdr_async_with_config(stream, path_filter, Some(websocket_config(&config))).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<Outbound>(config.client_queue_capacity);
    let registration = dispatcher.register(tx)?;
    let client_id = registration.client_id();
    info!(client_id = %client_id, peer = %peer_addr, "New WebSocket connection");

    let ping_interval = config.ping_interval();
    let ping_timeout = config.ping_timeout();
    let mut pinger = interval_at(Instant::now() + ping_interval, ping_interval);
    pinger.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.to_string())).await {
                            warn!(
                                client_id = %client_id,
                                error = %e,
                                "Failed to send WebSocket message"
                            );
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!(client_id = %client_id, "Closing connection");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = ws_rx.next() => {
                // Any frame proves the peer is alive
                pong_deadline = None;
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if registration.forward(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            client_id = %client_id,
                            bytes = data.len(),
                            "Ignoring binary message"
                        );
                    }
                    // tungstenite queues the pong reply itself
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(client_id = %client_id, "WebSocket connection closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %client_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            _ = pinger.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                        warn!(client_id = %client_id, error = %e, "Failed to send keepalive ping");
                        break;
                    }
                    pong_deadline = Some(Instant::now() + ping_timeout);
                }
            }
            _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                if pong_deadline.is_some() =>
            {
                warn!(client_id = %client_id, "Keepalive timeout, closing connection");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    drop(registration);
    info!(client_id = %client_id, peer = %peer_addr, "Client connection finished");
    Ok(())
}

fn websocket_config(config: &ServerConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);
    ws_config
}

fn not_found(endpoint: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!(
        "Not Found - WebSocket endpoint is at {}",
        endpoint
    )));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
