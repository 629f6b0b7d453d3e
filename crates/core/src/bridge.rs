//! Cross-context event bridge
//!
//! Engines raise events on their own threads (bus sync handlers, scheduler
//! threads). The bridge turns each event into an [`EventEnvelope`] and pushes
//! it onto a single unbounded MPSC queue owned by the dispatch context. Pushing
//! never blocks the engine, and the queue preserves arrival order, so events
//! of one pipeline reach the consumer in the order the engine raised them.
//!
//! ```text
//!  engine thread(s)                         dispatch context
//!  ┌──────────────┐   EventSink::emit()   ┌────────────────────┐
//!  │ bus handler  │ ────────┐             │ EventReceiver      │
//!  └──────────────┘         ▼             │  .recv() / drain() │
//!  ┌──────────────┐   ┌───────────┐       └────────────────────┘
//!  │ bus handler  │──▶│ MPSC queue│──────────────▲
//!  └──────────────┘   └───────────┘
//! ```
//!
//! Every subscription carries a [`SubscriptionId`]. Cancelling a subscription
//! stops further pushes, and envelopes that were already queued are rejected
//! by the consumer when the registry no longer holds that subscription (see
//! [`crate::ControlPlane::admit`]).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::{EngineEvent, EventSource};
use crate::error::ErrorCode;
use crate::state::PipelineState;

/// Identifies one event subscription (one engine handle lifetime)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Kind of an engine-origin event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Error,
    StateChanged,
    EndOfStream,
}

/// Event payload handed to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Error {
        error_code: ErrorCode,
        message: String,
        debug_details: Option<String>,
    },
    StateChanged {
        state: PipelineState,
        message: String,
    },
}

/// One engine event, stamped with its pipeline and subscription
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub pipeline_id: String,
    pub subscription: SubscriptionId,
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Unix milliseconds at the moment the engine raised the event
    pub origin_timestamp_ms: i64,
}

impl EventEnvelope {
    /// Translate an engine event; state changes of internal stages are dropped
    pub fn from_engine_event(
        pipeline_id: &str,
        subscription: SubscriptionId,
        event: EngineEvent,
    ) -> Option<Self> {
        let (kind, payload) = match event {
            EngineEvent::Error { message, debug, .. } => (
                EventKind::Error,
                EventPayload::Error {
                    error_code: ErrorCode::EngineError,
                    message,
                    debug_details: debug,
                },
            ),
            EngineEvent::EndOfStream => (
                EventKind::EndOfStream,
                EventPayload::StateChanged {
                    state: PipelineState::Null,
                    message: "End of stream".to_string(),
                },
            ),
            EngineEvent::StateChanged {
                source: EventSource::Pipeline,
                old,
                new,
            } => (
                EventKind::StateChanged,
                EventPayload::StateChanged {
                    state: new,
                    message: format!("State changed from {} to {}", old, new),
                },
            ),
            EngineEvent::StateChanged {
                source: EventSource::Stage(_),
                ..
            } => return None,
        };

        Some(Self {
            pipeline_id: pipeline_id.to_string(),
            subscription,
            kind,
            payload,
            origin_timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// Producer side of the bridge; cloneable, hands out subscriptions
#[derive(Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    next_subscription: Arc<AtomicU64>,
}

/// Consumer side of the bridge, owned by the dispatch context
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl EventBridge {
    /// Create a bridge and its single consumer
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_subscription: Arc::new(AtomicU64::new(1)),
            },
            EventReceiver { rx },
        )
    }

    /// Open a subscription for `pipeline_id`
    ///
    /// The returned [`EventSink`] is given to the engine; the [`Subscription`]
    /// stays with the pipeline handle and cancels the sink when dropped.
    pub fn subscribe(&self, pipeline_id: &str) -> (Subscription, EventSink) {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));
        let subscription = Subscription {
            id,
            active: Arc::clone(&active),
        };
        let sink = EventSink {
            pipeline_id: Arc::from(pipeline_id),
            subscription: id,
            active,
            tx: self.tx.clone(),
        };
        (subscription, sink)
    }
}

impl EventReceiver {
    /// Wait for the next envelope
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Take the next envelope if one is already queued
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Take every envelope queued right now, in arrival order
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Some(envelope) = self.try_recv() {
            out.push(envelope);
        }
        out
    }
}

/// Cancellation side of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop forwarding events from this subscription's sink
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Engine-facing producer for one subscription
///
/// `emit` is safe to call from any thread and never blocks.
#[derive(Clone)]
pub struct EventSink {
    pipeline_id: Arc<str>,
    subscription: SubscriptionId,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventSink {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Forward an engine event; returns false when it was not enqueued
    pub fn emit(&self, event: EngineEvent) -> bool {
        if !self.active.load(Ordering::Acquire) {
            tracing::trace!(
                pipeline_id = %self.pipeline_id,
                subscription = %self.subscription,
                "Dropping event for cancelled subscription"
            );
            return false;
        }

        let Some(envelope) =
            EventEnvelope::from_engine_event(&self.pipeline_id, self.subscription, event)
        else {
            return false;
        };

        self.tx.send(envelope).is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("pipeline_id", &self.pipeline_id)
            .field("subscription", &self.subscription)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
