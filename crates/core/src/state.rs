//! Pipeline states as reported by the engine

use serde::{Deserialize, Serialize};

/// Engine-level pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Null => "NULL",
            PipelineState::Ready => "READY",
            PipelineState::Paused => "PAUSED",
            PipelineState::Playing => "PLAYING",
        }
    }

    /// Next state on the way from `self` towards `target`, one step at a time
    ///
    /// Engines walk NULL → READY → PAUSED → PLAYING (and back) without skipping.
    pub fn step_towards(self, target: PipelineState) -> Option<PipelineState> {
        use PipelineState::*;
        let rank = |s: PipelineState| match s {
            Null => 0,
            Ready => 1,
            Paused => 2,
            Playing => 3,
        };
        let order = [Null, Ready, Paused, Playing];
        let (from, to) = (rank(self), rank(target));
        match from.cmp(&to) {
            std::cmp::Ordering::Less => Some(order[from + 1]),
            std::cmp::Ordering::Greater => Some(order[from - 1]),
            std::cmp::Ordering::Equal => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine accepted a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeOutcome {
    /// Reached the target synchronously
    Success,
    /// Accepted; the transition completes on the engine context
    Async,
    /// Accepted for a live source that cannot preroll
    NoPreroll,
}
