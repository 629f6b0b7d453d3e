//! Broadcast dispatcher
//!
//! The dispatch context. A single task owns the [`ControlPlane`], the set of
//! connected clients and the telemetry tick. Connection tasks talk to it
//! only through [`DispatchRequest`]s, and engine events reach it only
//! through the bridge's [`EventReceiver`], so no lock is ever shared with
//! engine threads or client sockets.
//!
//! The select loop is biased: shutdown first, then bridge events, then
//! client requests, then the telemetry tick. Queued engine events are
//! therefore always delivered before the next stats broadcast.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pipectl_core::{ControlPlane, EventEnvelope, EventReceiver};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::{now_ms, ClientCommand, ServerMessage};
use crate::session::SessionProtocolHandler;

/// Opaque identity of one connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What the dispatcher hands to a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded text frame, shared between all recipients of a broadcast
    Text(Arc<str>),
    /// Close the connection
    Close,
}

/// Requests from connection tasks to the dispatcher
#[derive(Debug)]
pub enum DispatchRequest {
    Connected {
        client_id: ClientId,
        tx: mpsc::Sender<Outbound>,
    },
    Inbound {
        client_id: ClientId,
        text: String,
    },
    Disconnected {
        client_id: ClientId,
    },
}

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<ClientId>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Membership of connected clients and their outbound queues
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: HashMap<ClientId, mpsc::Sender<Outbound>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client_id: ClientId, tx: mpsc::Sender<Outbound>) {
        self.clients.insert(client_id, tx);
    }

    /// Returns false if the client was not a member
    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.clients.remove(&client_id).is_some()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send to one client; returns false if it could not be queued
    pub fn send_to(&self, client_id: ClientId, message: &ServerMessage) -> Result<bool> {
        let Some(tx) = self.clients.get(&client_id) else {
            return Ok(false);
        };
        let text: Arc<str> = Arc::from(message.encode(now_ms())?);
        match tx.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    kind = message.kind(),
                    error = %e,
                    "Failed to queue reply"
                );
                Ok(false)
            }
        }
    }

    /// Encode once and queue for every member
    ///
    /// A full or closed queue counts as a failure for that client only;
    /// delivery to the others continues.
    pub fn broadcast(&self, message: &ServerMessage) -> Result<BroadcastReport> {
        let text: Arc<str> = Arc::from(message.encode(now_ms())?);
        let mut report = BroadcastReport::default();
        for (client_id, tx) in &self.clients {
            match tx.try_send(Outbound::Text(Arc::clone(&text))) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(client_id = %client_id, error = %e, "Broadcast delivery failed");
                    report.failed.push(*client_id);
                }
            }
        }
        Ok(report)
    }

    /// Ask every client to close and forget them all
    pub fn close_all(&mut self) {
        for (client_id, tx) in self.clients.drain() {
            if tx.try_send(Outbound::Close).is_err() {
                debug!(client_id = %client_id, "Client already gone at close");
            }
        }
    }
}

/// Cloneable entry point for connection tasks
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchRequest>,
    next_client: Arc<AtomicU64>,
}

impl DispatcherHandle {
    /// Join the client set; the returned guard leaves it when dropped
    pub fn register(&self, outbound: mpsc::Sender<Outbound>) -> Result<ClientRegistration> {
        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(DispatchRequest::Connected {
                client_id,
                tx: outbound,
            })
            .map_err(|_| Error::DispatcherStopped)?;
        Ok(ClientRegistration {
            client_id,
            tx: self.tx.clone(),
        })
    }
}

/// Membership of one connection
///
/// Dropping it deregisters the client, exactly once, whether the connection
/// ended cleanly, with an error, or by task cancellation.
#[derive(Debug)]
pub struct ClientRegistration {
    client_id: ClientId,
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl ClientRegistration {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Hand an inbound text frame to the dispatcher
    pub fn forward(&self, text: String) -> Result<()> {
        self.tx
            .send(DispatchRequest::Inbound {
                client_id: self.client_id,
                text,
            })
            .map_err(|_| Error::DispatcherStopped)
    }
}

impl Drop for ClientRegistration {
    fn drop(&mut self) {
        let _ = self.tx.send(DispatchRequest::Disconnected {
            client_id: self.client_id,
        });
    }
}

/// The dispatch context
pub struct BroadcastDispatcher {
    control: ControlPlane,
    events: EventReceiver,
    requests: mpsc::UnboundedReceiver<DispatchRequest>,
    clients: ClientSet,
    session: SessionProtocolHandler,
    telemetry_interval: Duration,
    telemetry_backoff: Duration,
}

impl BroadcastDispatcher {
    pub fn new(
        control: ControlPlane,
        events: EventReceiver,
        config: &ServerConfig,
    ) -> (Self, DispatcherHandle) {
        let (tx, requests) = mpsc::unbounded_channel();
        let dispatcher = Self {
            control,
            events,
            requests,
            clients: ClientSet::new(),
            session: SessionProtocolHandler::new(),
            telemetry_interval: config.telemetry_interval(),
            telemetry_backoff: config.telemetry_error_backoff(),
        };
        let handle = DispatcherHandle {
            tx,
            next_client: Arc::new(AtomicU64::new(1)),
        };
        (dispatcher, handle)
    }

    /// Run until shutdown is signalled, then tear everything down in order
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.telemetry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            engine = self.control.engine_name(),
            telemetry_interval_ms = self.telemetry_interval.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Dispatcher received shutdown signal");
                    break;
                }
                Some(envelope) = self.events.recv() => {
                    self.handle_event(envelope);
                }
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        None => {
                            info!("All dispatcher handles dropped");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    for envelope in self.events.drain() {
                        self.handle_event(envelope);
                    }
                    if let Err(e) = self.poll_telemetry() {
                        error!(
                            error = %e,
                            backoff_ms = self.telemetry_backoff.as_millis() as u64,
                            "Error polling telemetry"
                        );
                        ticker.reset_after(self.telemetry_backoff);
                    }
                }
            }
        }

        self.shutdown();
    }

    fn handle_request(&mut self, request: DispatchRequest) {
        match request {
            DispatchRequest::Connected { client_id, tx } => {
                self.clients.insert(client_id, tx);
                info!(client_id = %client_id, clients = self.clients.len(), "Client connected");

                let snapshot = self.session.on_connect(&mut self.control);
                self.reply(client_id, &snapshot);
            }
            DispatchRequest::Inbound { client_id, text } => {
                let command = match ClientCommand::parse(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Invalid message received");
                        return;
                    }
                };
                debug!(client_id = %client_id, kind = command.kind(), "Received message");

                if let Some(reply) = self.session.handle(&mut self.control, command) {
                    self.reply(client_id, &reply);
                }
            }
            DispatchRequest::Disconnected { client_id } => {
                if self.clients.remove(client_id) {
                    info!(
                        client_id = %client_id,
                        clients = self.clients.len(),
                        "Client disconnected"
                    );
                }
            }
        }
    }

    fn handle_event(&mut self, envelope: EventEnvelope) {
        let Some(message) = self.session.on_event(&mut self.control, &envelope) else {
            return;
        };
        self.broadcast(&message);
    }

    /// Broadcast `pipelineStats` for every PLAYING pipeline
    fn poll_telemetry(&mut self) -> Result<()> {
        if self.clients.is_empty() {
            return Ok(());
        }
        for status in self.control.playing_statuses()? {
            let report = self.clients.broadcast(&ServerMessage::stats(status))?;
            if !report.is_complete() {
                warn!(failed = report.failed.len(), "Stats update not delivered to every client");
            }
        }
        Ok(())
    }

    fn reply(&self, client_id: ClientId, message: &ServerMessage) {
        if let Err(e) = self.clients.send_to(client_id, message) {
            error!(
                client_id = %client_id,
                kind = message.kind(),
                error = %e,
                "Failed to encode reply"
            );
        }
    }

    fn broadcast(&self, message: &ServerMessage) {
        match self.clients.broadcast(message) {
            Ok(report) if !report.is_complete() => {
                warn!(
                    kind = message.kind(),
                    delivered = report.delivered,
                    failed = report.failed.len(),
                    "Broadcast not delivered to every client"
                );
            }
            Ok(_) => {}
            Err(e) => error!(kind = message.kind(), error = %e, "Failed to encode broadcast"),
        }
    }

    /// Delete every pipeline, close every client, then stop the engine
    fn shutdown(&mut self) {
        info!("Shutting down...");
        self.control.delete_all();
        // Anything still queued belongs to pipelines that no longer exist
        let discarded = self.events.drain().len();
        if discarded > 0 {
            debug!(discarded, "Discarded pending engine events");
        }
        self.clients.close_all();
        self.control.shutdown();
        info!("Dispatcher stopped");
    }
}
