//! The item state store.
//!
//! A [`StateStore`] owns the single [`PipelineState`] record of a run. All
//! mutation goes through [`StateStore::upsert`], which enforces the item
//! state machine; [`StateStore::persist`] atomically replaces the on-disk
//! copy with a snapshot of the in-memory record.

use super::atomic::write_json_atomic;
use super::types::{ItemState, PipelineState, StageState};
use crate::backend::BackendId;
use crate::core::{ItemStatus, RunStatus, StageStatus, TokenUsage};
use crate::errors::{ItemflowError, StateError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A partial update applied to an item's state.
///
/// Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    status: Option<ItemStatus>,
    attempts: Option<u32>,
    backend: Option<BackendId>,
    duration_ms: Option<u64>,
    token_usage: Option<TokenUsage>,
    error: Option<(String, String)>,
    fast_path: Option<bool>,
    skip_reason: Option<String>,
}

impl ItemUpdate {
    /// Creates an update that changes the status.
    #[must_use]
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the backend used.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendId) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the token usage.
    #[must_use]
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    /// Sets the error message and kind.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>, kind: impl Into<String>) -> Self {
        self.error = Some((message.into(), kind.into()));
        self
    }

    /// Marks the item as resolved on the fast path.
    #[must_use]
    pub fn with_fast_path(mut self, fast_path: bool) -> Self {
        self.fast_path = Some(fast_path);
        self
    }

    /// Sets the skip reason.
    #[must_use]
    pub fn with_skip_reason(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }
}

/// Durable, mutex-guarded store for one run's state.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<PipelineState>,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Creates a store that never touches disk.
    #[must_use]
    pub fn in_memory(state: PipelineState) -> Self {
        Self {
            path: None,
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a store backed by `path` and writes the initial record.
    pub fn create(path: impl Into<PathBuf>, state: PipelineState) -> Result<Self, ItemflowError> {
        let store = Self {
            path: Some(path.into()),
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
        };
        store.persist()?;
        Ok(store)
    }

    /// Opens an existing state file for resumption.
    ///
    /// The recorded pipeline name must match `pipeline`. Stages missing from
    /// the record are added as pending, and items left `running` by an
    /// interrupted process are reset to `pending` with zero attempts.
    pub fn open(
        path: impl Into<PathBuf>,
        pipeline: &str,
        stages: &[String],
    ) -> Result<Self, ItemflowError> {
        let path = path.into();
        let bytes = std::fs::read(&path)?;
        let mut state: PipelineState = serde_json::from_slice(&bytes)?;

        if state.pipeline != pipeline {
            return Err(StateError::PipelineMismatch {
                expected: pipeline.to_string(),
                found: state.pipeline,
            }
            .into());
        }

        state.stages = stages.to_vec();
        for name in stages {
            state.stage_states.entry(name.clone()).or_default();
        }

        let recovered = recover_interrupted(&mut state);
        if recovered > 0 {
            info!(run_id = %state.run_id, recovered, "Reset interrupted items to pending");
        }
        if !state.all_stages_completed() {
            state.status = RunStatus::Running;
            state.completed_at = None;
        }

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.state.lock().run_id.clone()
    }

    /// Returns a copy of the full record.
    #[must_use]
    pub fn snapshot(&self) -> PipelineState {
        self.state.lock().clone()
    }

    /// Returns an item's state.
    #[must_use]
    pub fn get(&self, stage: &str, item_id: &str) -> Option<ItemState> {
        self.state
            .lock()
            .stage_states
            .get(stage)
            .and_then(|s| s.items.get(item_id))
            .cloned()
    }

    /// Returns a copy of a stage's state.
    #[must_use]
    pub fn stage_state(&self, stage: &str) -> Option<StageState> {
        self.state.lock().stage_states.get(stage).cloned()
    }

    /// Returns a stage's status.
    #[must_use]
    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.state.lock().stage_states.get(stage).map(|s| s.status)
    }

    /// Returns the run status.
    #[must_use]
    pub fn run_status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Creates or updates an item record.
    ///
    /// Terminal records are immutable, and status changes must follow
    /// `pending -> running -> {completed, skipped, failed}`.
    pub fn upsert(
        &self,
        stage: &str,
        item_id: &str,
        update: ItemUpdate,
    ) -> Result<ItemState, StateError> {
        let mut state = self.state.lock();
        let stage_state = state
            .stage_states
            .get_mut(stage)
            .ok_or_else(|| StateError::UnknownStage(stage.to_string()))?;

        let current = stage_state.items.get(item_id).cloned().unwrap_or_default();
        if current.is_terminal() {
            return Err(StateError::Terminal {
                stage: stage.to_string(),
                item_id: item_id.to_string(),
                status: current.status,
            });
        }

        let mut next = current.clone();
        if let Some(status) = update.status {
            if !current.status.can_transition_to(status) {
                return Err(StateError::InvalidTransition {
                    stage: stage.to_string(),
                    item_id: item_id.to_string(),
                    from: current.status,
                    to: status,
                });
            }
            next.status = status;
            let now = Utc::now();
            if status == ItemStatus::Running && next.started_at.is_none() {
                next.started_at = Some(now);
            }
            if status.is_terminal() {
                next.completed_at = Some(now);
            }
        }
        if let Some(attempts) = update.attempts {
            next.attempts = attempts;
        }
        if let Some(backend) = update.backend {
            next.backend = Some(backend);
        }
        if let Some(duration) = update.duration_ms {
            next.duration_ms = Some(duration);
        }
        if let Some(usage) = update.token_usage {
            next.token_usage = Some(usage);
        }
        if let Some((message, kind)) = update.error {
            next.error = Some(message);
            next.error_kind = Some(kind);
        }
        if let Some(fast_path) = update.fast_path {
            next.fast_path = fast_path;
        }
        if let Some(reason) = update.skip_reason {
            next.skip_reason = Some(reason);
        }

        if !stage_state.items.contains_key(item_id) {
            stage_state.total_items += 1;
        }
        if next.is_terminal() {
            stage_state.tally(next.status, true);
            if let Some(usage) = next.token_usage {
                stage_state.token_usage += usage;
            }
        }
        stage_state.items.insert(item_id.to_string(), next.clone());
        Ok(next)
    }

    /// Marks a stage as running and registers its loaded items.
    ///
    /// Terminal records from earlier attempts are kept; non-terminal records
    /// for items the loader no longer returns are dropped.
    pub fn begin_stage(&self, stage: &str, item_ids: &[String]) -> Result<(), StateError> {
        let mut state = self.state.lock();
        let stage_state = state
            .stage_states
            .get_mut(stage)
            .ok_or_else(|| StateError::UnknownStage(stage.to_string()))?;

        let loaded: HashSet<&str> = item_ids.iter().map(String::as_str).collect();
        stage_state
            .items
            .retain(|id, item| item.is_terminal() || loaded.contains(id.as_str()));
        for id in item_ids {
            stage_state.items.entry(id.clone()).or_default();
        }
        stage_state.recount();

        if stage_state.status == StageStatus::Pending {
            stage_state.started_at = Some(Utc::now());
        }
        stage_state.status = StageStatus::Running;
        stage_state.completed_at = None;
        state.current_stage = Some(stage.to_string());
        debug!(stage, items = item_ids.len(), "Stage registered");
        Ok(())
    }

    /// Marks a stage as completed and returns its final state.
    pub fn complete_stage(&self, stage: &str) -> Result<StageState, StateError> {
        let mut state = self.state.lock();
        let stage_state = state
            .stage_states
            .get_mut(stage)
            .ok_or_else(|| StateError::UnknownStage(stage.to_string()))?;
        stage_state.recount();
        stage_state.status = StageStatus::Completed;
        stage_state.completed_at = Some(Utc::now());
        let snapshot = stage_state.clone();
        state.recompute_token_usage();
        Ok(snapshot)
    }

    /// Resets an item to pending so the next resume reprocesses it.
    ///
    /// Reopens the owning stage and the run. Returns the previous state.
    pub fn reset_item(&self, stage: &str, item_id: &str) -> Result<Option<ItemState>, StateError> {
        let mut state = self.state.lock();
        let stage_state = state
            .stage_states
            .get_mut(stage)
            .ok_or_else(|| StateError::UnknownStage(stage.to_string()))?;
        let fresh = ItemState {
            reset_at: Some(Utc::now()),
            ..ItemState::default()
        };
        let Some(previous) = stage_state.items.insert(item_id.to_string(), fresh) else {
            stage_state.items.remove(item_id);
            return Ok(None);
        };
        stage_state.recount();
        stage_state.status = StageStatus::Running;
        stage_state.completed_at = None;
        state.recompute_token_usage();
        state.status = RunStatus::Running;
        state.completed_at = None;
        info!(stage, item_id, previous = %previous.status, "Item reset to pending");
        Ok(Some(previous))
    }

    /// Marks the run as completed.
    pub fn finalize(&self) {
        let mut state = self.state.lock();
        state.recompute_token_usage();
        state.status = RunStatus::Completed;
        state.current_stage = None;
        state.completed_at = Some(Utc::now());
    }

    /// Writes the current record to disk. A no-op for in-memory stores.
    pub fn persist(&self) -> Result<(), ItemflowError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        let snapshot = self.snapshot();
        write_json_atomic(path, &snapshot)
    }
}

fn recover_interrupted(state: &mut PipelineState) -> usize {
    let mut recovered = 0;
    for stage in state.stage_states.values_mut() {
        for item in stage.items.values_mut() {
            if item.status == ItemStatus::Running {
                *item = ItemState {
                    reset_at: item.reset_at,
                    ..ItemState::default()
                };
                recovered += 1;
            }
        }
        stage.recount();
    }
    recovered
}
