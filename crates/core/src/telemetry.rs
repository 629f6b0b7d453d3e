//! Pipeline telemetry
//!
//! Stats are advisory and recomputed on every status query. The default
//! [`SimulatedTelemetry`] derives counters from the stream position; a real
//! counter source only has to implement [`TelemetryProvider`] and may fail
//! with [`EngineError::Telemetry`] when a query goes wrong.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::state::PipelineState;

/// Telemetry snapshot; serializes to `{}` when nothing is known
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Buffer fill level in percent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_health: Option<u32>,

    /// Bits per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_received: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_dropped: Option<u64>,

    /// End-to-end latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u32>,
}

impl PipelineStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Source of telemetry values for a pipeline
pub trait TelemetryProvider: Send + Sync {
    fn sample(
        &self,
        pipeline_id: &str,
        state: PipelineState,
        position: Option<Duration>,
    ) -> Result<PipelineStats, EngineError>;
}

/// Placeholder provider with fixed health figures and position-derived frame counters
#[derive(Debug, Clone)]
pub struct SimulatedTelemetry {
    pub buffer_health: u32,
    pub bitrate: u64,
    pub frame_rate: f64,
    pub drop_rate: f64,
    pub latency_ms: u32,
}

impl Default for SimulatedTelemetry {
    fn default() -> Self {
        Self {
            buffer_health: 80,
            bitrate: 2_500_000,
            frame_rate: 30.0,
            drop_rate: 0.5,
            latency_ms: 150,
        }
    }
}

impl TelemetryProvider for SimulatedTelemetry {
    fn sample(
        &self,
        _pipeline_id: &str,
        _state: PipelineState,
        position: Option<Duration>,
    ) -> Result<PipelineStats, EngineError> {
        let seconds = position.map(|p| p.as_secs_f64()).unwrap_or(0.0);
        Ok(PipelineStats {
            buffer_health: Some(self.buffer_health),
            bitrate: Some(self.bitrate),
            frames_received: Some(100 + (seconds * self.frame_rate) as u64),
            frames_dropped: Some((seconds * self.drop_rate) as u64),
            latency: Some(self.latency_ms),
        })
    }
}
