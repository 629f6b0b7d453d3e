//! Control plane, event bridge and simulated engine working together
//!
//! Events are raised on the simulated engine's scheduler thread and consumed
//! here the way the dispatch context consumes them: `recv`, then `admit`.

use std::sync::Arc;
use std::time::Duration;

use pipectl_core::{
    ControlPlane, EventEnvelope, EventKind, EventPayload, EventReceiver, PipelineRequest,
    PipelineState, SimulatedEngine, SimulatedTelemetry, StageSpec,
};

fn setup() -> (Arc<SimulatedEngine>, ControlPlane, EventReceiver) {
    let engine = Arc::new(SimulatedEngine::new().unwrap());
    let (control, events) =
        ControlPlane::new(engine.clone(), Arc::new(SimulatedTelemetry::default()));
    (engine, control, events)
}

fn request(id: &str) -> PipelineRequest {
    PipelineRequest::new(vec![
        StageSpec::new("videotestsrc").with_property("is-live", "true"),
        StageSpec::new("fakesink"),
    ])
    .with_id(id)
}

async fn next_event(events: &mut EventReceiver) -> EventEnvelope {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("event bridge closed")
}

fn state_of(envelope: &EventEnvelope) -> PipelineState {
    match &envelope.payload {
        EventPayload::StateChanged { state, .. } => *state,
        other => panic!("expected a state change, got {:?}", other),
    }
}

#[tokio::test]
async fn test_start_emits_ordered_state_changes() {
    let (_engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();
    control.start_pipeline("p1").unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&PipelineState::Playing) {
        let envelope = next_event(&mut events).await;
        assert_eq!(envelope.pipeline_id, "p1");
        assert_eq!(envelope.kind, EventKind::StateChanged);
        assert!(control.admit(&envelope));
        seen.push(state_of(&envelope));
    }

    assert_eq!(
        seen,
        vec![PipelineState::Ready, PipelineState::Paused, PipelineState::Playing]
    );
    assert_eq!(
        control.registry().lookup("p1").unwrap().last_known_state(),
        PipelineState::Playing
    );

    let status = control.pipeline_status("p1").unwrap();
    assert_eq!(status.state, PipelineState::Playing);
    assert_eq!(status.stats.bitrate, Some(2_500_000));
}

#[tokio::test]
async fn test_state_change_message_names_both_states() {
    let (_engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();
    control.start_pipeline("p1").unwrap();

    let envelope = next_event(&mut events).await;
    match envelope.payload {
        EventPayload::StateChanged { state, message } => {
            assert_eq!(state, PipelineState::Ready);
            assert_eq!(message, "State changed from NULL to READY");
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_error_is_recorded_without_state_change() {
    let (engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();

    engine
        .inject_error(
            "p1",
            "Internal data stream error",
            Some("streaming stopped, reason not-linked"),
        )
        .unwrap();

    let envelope = next_event(&mut events).await;
    assert_eq!(envelope.kind, EventKind::Error);
    assert!(control.admit(&envelope));
    match &envelope.payload {
        EventPayload::Error {
            message,
            debug_details,
            ..
        } => {
            assert_eq!(message, "Internal data stream error");
            assert_eq!(debug_details.as_deref(), Some("streaming stopped, reason not-linked"));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let status = control.pipeline_status("p1").unwrap();
    assert_eq!(status.state, PipelineState::Null);
    assert_eq!(status.error.as_deref(), Some("Internal data stream error"));
}

#[tokio::test]
async fn test_end_of_stream_is_reported_as_null() {
    let (engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();
    engine.inject_eos("p1").unwrap();

    let envelope = next_event(&mut events).await;
    assert_eq!(envelope.kind, EventKind::EndOfStream);
    assert_eq!(
        envelope.payload,
        EventPayload::StateChanged {
            state: PipelineState::Null,
            message: "End of stream".to_string(),
        }
    );
}

#[tokio::test]
async fn test_per_pipeline_order_is_preserved() {
    let (_engine, mut control, mut events) = setup();
    for id in ["a", "b"] {
        control.create_pipeline(request(id)).unwrap();
    }
    control.start_pipeline("a").unwrap();
    control.start_pipeline("b").unwrap();
    control.stop_pipeline("a").unwrap();

    let mut a_states = Vec::new();
    let mut b_states = Vec::new();
    while a_states.len() < 4 || b_states.len() < 3 {
        let envelope = next_event(&mut events).await;
        match envelope.pipeline_id.as_str() {
            "a" => a_states.push(state_of(&envelope)),
            "b" => b_states.push(state_of(&envelope)),
            other => panic!("event for unknown pipeline {}", other),
        }
    }

    assert_eq!(
        a_states,
        vec![
            PipelineState::Ready,
            PipelineState::Paused,
            PipelineState::Playing,
            PipelineState::Paused,
        ]
    );
    assert_eq!(
        b_states,
        vec![PipelineState::Ready, PipelineState::Paused, PipelineState::Playing]
    );
}

#[tokio::test]
async fn test_recreated_pipeline_ignores_old_subscription() {
    let (_engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();
    control.start_pipeline("p1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    control.delete_pipeline("p1").unwrap();
    control.create_pipeline(request("p1")).unwrap();
    let live = control.registry().lookup("p1").unwrap().subscription_id().unwrap();

    for envelope in events.drain() {
        assert_ne!(envelope.subscription, live);
        assert!(!control.admit(&envelope));
    }
    assert_eq!(control.pipeline_status("p1").unwrap().state, PipelineState::Null);
}

#[tokio::test]
async fn test_paused_pipeline_resumes() {
    let (_engine, mut control, mut events) = setup();
    control.create_pipeline(request("p1")).unwrap();
    control.start_pipeline("p1").unwrap();
    control.stop_pipeline("p1").unwrap();
    control.start_pipeline("p1").unwrap();

    let mut last = PipelineState::Null;
    let mut transitions = 0;
    while transitions < 5 {
        let envelope = next_event(&mut events).await;
        assert!(control.admit(&envelope));
        last = state_of(&envelope);
        transitions += 1;
    }
    assert_eq!(last, PipelineState::Playing);
    assert!(control.playing_statuses().unwrap().iter().any(|s| s.id == "p1"));
}
