//! Pipeline registry
//!
//! The single authoritative mapping from pipeline id to [`PipelineHandle`].
//! Iteration follows insertion order.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::bridge::SubscriptionId;
use crate::error::{Error, Result};
use crate::handle::{PipelineHandle, StateSnapshot, StatusSnapshot};
use crate::state::PipelineState;

/// How many deleted ids are remembered for repeated deletes
pub const RETIRED_ID_MEMORY: usize = 256;

#[derive(Default)]
pub struct PipelineRegistry {
    handles: HashMap<String, PipelineHandle>,
    order: Vec<String>,
    retired: VecDeque<StateSnapshot>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    /// Ids in insertion order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Insert a created handle under its id
    pub fn register(
        &mut self,
        handle: PipelineHandle,
    ) -> std::result::Result<(), (Error, PipelineHandle)> {
        let id = handle.id().to_string();
        if self.handles.contains_key(&id) {
            return Err((Error::AlreadyExists(id), handle));
        }
        self.retired.retain(|snapshot| snapshot.id != id);
        self.order.push(id.clone());
        self.handles.insert(id, handle);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<&PipelineHandle> {
        self.handles
            .get(id)
            .ok_or_else(|| Error::NotFound(Some(id.to_string())))
    }

    pub fn lookup_mut(&mut self, id: &str) -> Result<&mut PipelineHandle> {
        self.handles
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(Some(id.to_string())))
    }

    /// Remove and tear down a pipeline
    ///
    /// Order matters: the event subscription is cancelled first, then the
    /// entry leaves the map, and only then is the engine pipeline released.
    /// Deleting an id that was deleted recently answers with the same NULL
    /// snapshot instead of `not-found`.
    pub fn remove(&mut self, id: &str) -> Result<StateSnapshot> {
        let Some(handle) = self.handles.get_mut(id) else {
            return self
                .retired
                .iter()
                .find(|snapshot| snapshot.id == id)
                .cloned()
                .ok_or_else(|| Error::NotFound(Some(id.to_string())));
        };
        handle.cancel_events();

        let mut handle = self
            .handles
            .remove(id)
            .ok_or_else(|| Error::NotFound(Some(id.to_string())))?;
        self.order.retain(|existing| existing != id);

        let snapshot = handle.delete();
        if self.retired.len() == RETIRED_ID_MEMORY {
            self.retired.pop_front();
        }
        self.retired.push_back(snapshot.clone());
        Ok(snapshot)
    }

    /// Status of every pipeline, in insertion order
    ///
    /// A pipeline whose telemetry query fails is listed with its cached status.
    pub fn list_statuses(&mut self) -> Vec<StatusSnapshot> {
        let mut statuses = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let Some(handle) = self.handles.get_mut(id) else {
                continue;
            };
            match handle.status() {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(
                        pipeline_id = %id,
                        error = %e,
                        "Status query failed, listing cached status"
                    );
                    statuses.push(handle.cached_status());
                }
            }
        }
        statuses
    }

    /// Live status of every PLAYING pipeline; the first failed query aborts the scan
    pub fn playing_statuses(&mut self) -> Result<Vec<StatusSnapshot>> {
        let mut statuses = Vec::new();
        for id in &self.order {
            let Some(handle) = self.handles.get_mut(id) else {
                continue;
            };
            let status = handle.status()?;
            if status.state == PipelineState::Playing {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    /// True when `subscription` is the live subscription of pipeline `id`
    pub fn is_current_subscription(&self, id: &str, subscription: SubscriptionId) -> bool {
        self.handles
            .get(id)
            .and_then(PipelineHandle::subscription_id)
            .is_some_and(|current| current == subscription)
    }

    /// Remove every pipeline (shutdown), returning their final snapshots
    pub fn drain(&mut self) -> Vec<StateSnapshot> {
        let ids = self.order.clone();
        ids.iter().filter_map(|id| self.remove(id).ok()).collect()
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.order)
            .finish()
    }
}
