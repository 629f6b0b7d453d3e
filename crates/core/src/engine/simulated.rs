//! In-process simulated engine
//!
//! Behaves like a real engine from the control plane's point of view: it
//! parses launch lines, rejects unknown stage types, accepts state requests
//! asynchronously and settles them on its own scheduler thread, raising
//! stage-level and pipeline-level state-change events from that thread.
//!
//! A stage property `simulate-fail=start` makes the PLAYING request fail,
//! `simulate-fail=pause` makes the PAUSED request fail.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::{EngineEvent, EngineHandle, EventSource, MediaEngine};
use crate::bridge::EventSink;
use crate::error::EngineError;
use crate::state::{PipelineState, StateChangeOutcome};

/// How long `release` waits for the scheduler to acknowledge NULL
pub const RELEASE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Stage types the simulated engine knows how to "build"
pub const DEFAULT_STAGE_TYPES: &[&str] = &[
    "appsink",
    "appsrc",
    "audioconvert",
    "audioresample",
    "audiotestsrc",
    "autoaudiosink",
    "autovideosink",
    "capsfilter",
    "decodebin",
    "fakesink",
    "fakesrc",
    "filesink",
    "filesrc",
    "flvmux",
    "h264parse",
    "identity",
    "mpegtsmux",
    "opusenc",
    "queue",
    "rtmpsink",
    "rtph264pay",
    "rtpopuspay",
    "srtsink",
    "srtsrc",
    "tee",
    "textoverlay",
    "udpsink",
    "udpsrc",
    "uridecodebin",
    "videoconvert",
    "videoscale",
    "videotestsrc",
    "vp8enc",
    "x264enc",
    "x265enc",
];

const FAULT_PROPERTY: &str = "simulate-fail";

type SharedPipeline = Arc<Mutex<SimPipeline>>;

/// Live pipelines by name, for fault injection; handles remove their own entry on drop
type PipelineIndex = Arc<Mutex<HashMap<String, Weak<Mutex<SimPipeline>>>>>;

enum SchedulerCommand {
    Transition {
        pipeline: SharedPipeline,
        target: PipelineState,
    },
    Raise {
        pipeline: SharedPipeline,
        event: EngineEvent,
    },
    Release {
        pipeline: SharedPipeline,
        ack: Sender<()>,
    },
    Shutdown,
}

struct SimPipeline {
    name: String,
    stages: Vec<String>,
    current: PipelineState,
    /// Last state requested through `set_state`
    requested: PipelineState,
    playing_since: Option<Instant>,
    played: Duration,
    fail_on_start: bool,
    fail_on_pause: bool,
    released: bool,
    events: EventSink,
}

impl SimPipeline {
    fn position(&self) -> Duration {
        self.played + self.playing_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Walk to `target` one state at a time, raising events along the way
    fn settle(&mut self, target: PipelineState) {
        while let Some(next) = self.current.step_towards(target) {
            let old = self.current;
            match (old, next) {
                (PipelineState::Playing, _) => {
                    let since = self.playing_since.take();
                    self.played += since.map(|t| t.elapsed()).unwrap_or_default();
                }
                (_, PipelineState::Playing) => self.playing_since = Some(Instant::now()),
                _ => {}
            }
            if next == PipelineState::Null {
                self.played = Duration::ZERO;
            }
            self.current = next;

            for stage in &self.stages {
                self.events.emit(EngineEvent::StateChanged {
                    source: EventSource::Stage(stage.clone()),
                    old,
                    new: next,
                });
            }
            self.events.emit(EngineEvent::StateChanged {
                source: EventSource::Pipeline,
                old,
                new: next,
            });
        }
    }
}

/// Simulated engine with a dedicated scheduler thread
pub struct SimulatedEngine {
    commands: Sender<SchedulerCommand>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    stage_types: HashSet<String>,
    pipelines: PipelineIndex,
}

impl SimulatedEngine {
    /// Engine that knows [`DEFAULT_STAGE_TYPES`]
    pub fn new() -> Result<Self, EngineError> {
        Self::with_stage_types(DEFAULT_STAGE_TYPES.iter().copied())
    }

    /// Engine that knows exactly the given stage types
    pub fn with_stage_types<I, S>(stage_types: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (commands, rx) = channel::unbounded();
        let scheduler = std::thread::Builder::new()
            .name("sim-engine".to_string())
            .spawn(move || run_scheduler(rx))
            .map_err(|e| EngineError::Unavailable(format!("failed to spawn scheduler: {}", e)))?;

        Ok(Self {
            commands,
            scheduler: Mutex::new(Some(scheduler)),
            stage_types: stage_types.into_iter().map(Into::into).collect(),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Raise an error on the engine thread as if an element had failed
    pub fn inject_error(
        &self,
        name: &str,
        message: &str,
        debug: Option<&str>,
    ) -> Result<(), EngineError> {
        let source = EventSource::Stage(format!("{}-stage", name));
        self.raise(
            name,
            EngineEvent::Error {
                source,
                message: message.to_string(),
                debug: debug.map(str::to_string),
            },
        )
    }

    /// Raise end-of-stream on the engine thread
    pub fn inject_eos(&self, name: &str) -> Result<(), EngineError> {
        self.raise(name, EngineEvent::EndOfStream)
    }

    fn raise(&self, name: &str, event: EngineEvent) -> Result<(), EngineError> {
        let pipeline = self
            .pipelines
            .lock()
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::Unavailable(format!("no pipeline named {}", name)))?;
        self.commands
            .send(SchedulerCommand::Raise { pipeline, event })
            .map_err(|_| EngineError::Unavailable("scheduler stopped".to_string()))
    }

    fn parse(&self, launch_line: &str) -> Result<Vec<ParsedStage>, EngineError> {
        let mut stages = Vec::new();
        for fragment in split_outside_quotes(launch_line, '!') {
            let mut tokens = tokenize(&fragment)?.into_iter();
            let stage_type = tokens
                .next()
                .ok_or_else(|| EngineError::Parse("syntax error: empty element".to_string()))?;
            if !self.stage_types.contains(&stage_type) {
                return Err(EngineError::Parse(format!("no element \"{}\"", stage_type)));
            }

            let mut properties = Vec::new();
            for token in tokens {
                let (key, value) = token.split_once('=').ok_or_else(|| {
                    EngineError::Parse(format!("syntax error near '{}'", token))
                })?;
                properties.push((key.to_string(), value.to_string()));
            }
            stages.push(ParsedStage {
                stage_type,
                properties,
            });
        }
        Ok(stages)
    }
}

impl MediaEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn launch(
        &self,
        name: &str,
        launch_line: &str,
        events: EventSink,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        let parsed = self.parse(launch_line)?;

        let mut counters: HashMap<&str, usize> = HashMap::new();
        let mut stages = Vec::with_capacity(parsed.len());
        let mut fail_on_start = false;
        let mut fail_on_pause = false;
        for stage in &parsed {
            let n = counters.entry(stage.stage_type.as_str()).or_default();
            stages.push(format!("{}{}", stage.stage_type, n));
            *n += 1;
            for (key, value) in &stage.properties {
                if key == FAULT_PROPERTY {
                    fail_on_start |= value == "start";
                    fail_on_pause |= value == "pause";
                }
            }
        }

        let pipeline = Arc::new(Mutex::new(SimPipeline {
            name: name.to_string(),
            stages,
            current: PipelineState::Null,
            requested: PipelineState::Null,
            playing_since: None,
            played: Duration::ZERO,
            fail_on_start,
            fail_on_pause,
            released: false,
            events,
        }));
        {
            let mut index = self.pipelines.lock();
            index.retain(|_, entry| entry.strong_count() > 0);
            index.insert(name.to_string(), Arc::downgrade(&pipeline));
        }

        tracing::debug!(pipeline = %name, launch_line = %launch_line, "Simulated pipeline built");

        Ok(Box::new(SimulatedHandle {
            name: name.to_string(),
            pipeline,
            commands: self.commands.clone(),
            index: Arc::clone(&self.pipelines),
        }))
    }

    fn shutdown(&self) {
        let Some(scheduler) = self.scheduler.lock().take() else {
            return;
        };
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        if scheduler.join().is_err() {
            tracing::error!("Simulated engine scheduler panicked");
        }
        tracing::debug!("Simulated engine scheduler stopped");
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SimulatedHandle {
    name: String,
    pipeline: SharedPipeline,
    commands: Sender<SchedulerCommand>,
    index: PipelineIndex,
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        let mut index = self.index.lock();
        // A relaunch under the same name owns the entry now
        let owned = index
            .get(&self.name)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(&self.pipeline)));
        if owned {
            index.remove(&self.name);
        }
    }
}

impl EngineHandle for SimulatedHandle {
    fn set_state(&mut self, target: PipelineState) -> Result<StateChangeOutcome, EngineError> {
        {
            let mut pipeline = self.pipeline.lock();
            let refused = match target {
                PipelineState::Playing => pipeline.fail_on_start,
                PipelineState::Paused => pipeline.fail_on_pause,
                _ => false,
            };
            if refused {
                return Err(EngineError::StateChange {
                    target: target.to_string(),
                    reason: format!("{} refused the transition", pipeline.name),
                });
            }
            if pipeline.current == target && pipeline.requested == target {
                return Ok(StateChangeOutcome::Success);
            }
            pipeline.requested = target;
        }

        self.commands
            .send(SchedulerCommand::Transition {
                pipeline: Arc::clone(&self.pipeline),
                target,
            })
            .map_err(|_| EngineError::Unavailable("scheduler stopped".to_string()))?;
        Ok(StateChangeOutcome::Async)
    }

    fn current_state(&self) -> PipelineState {
        self.pipeline.lock().current
    }

    fn position(&self) -> Option<Duration> {
        let pipeline = self.pipeline.lock();
        match pipeline.current {
            PipelineState::Null | PipelineState::Ready => None,
            _ => Some(pipeline.position()),
        }
    }

    fn release(&mut self) -> Result<(), EngineError> {
        let (ack, acked) = channel::bounded(1);
        self.commands
            .send(SchedulerCommand::Release {
                pipeline: Arc::clone(&self.pipeline),
                ack,
            })
            .map_err(|_| EngineError::Unavailable("scheduler stopped".to_string()))?;
        acked
            .recv_timeout(RELEASE_ACK_TIMEOUT)
            .map_err(|_| EngineError::StateChange {
                target: PipelineState::Null.to_string(),
                reason: "no acknowledgement from scheduler".to_string(),
            })
    }
}

fn run_scheduler(commands: Receiver<SchedulerCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            SchedulerCommand::Transition { pipeline, target } => {
                let mut pipeline = pipeline.lock();
                if !pipeline.released {
                    pipeline.settle(target);
                }
            }
            SchedulerCommand::Raise { pipeline, event } => {
                let pipeline = pipeline.lock();
                if !pipeline.released {
                    pipeline.events.emit(event);
                }
            }
            SchedulerCommand::Release { pipeline, ack } => {
                let mut pipeline = pipeline.lock();
                pipeline.requested = PipelineState::Null;
                pipeline.settle(PipelineState::Null);
                pipeline.released = true;
                let _ = ack.send(());
            }
            SchedulerCommand::Shutdown => break,
        }
    }
}

struct ParsedStage {
    stage_type: String,
    properties: Vec<(String, String)>,
}

fn split_outside_quotes(line: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == separator && !in_quotes => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn tokenize(fragment: &str) -> Result<Vec<String>, EngineError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = fragment.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(EngineError::Parse("syntax error: unterminated quote".to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}
