//! Serializable state records.

use crate::backend::BackendId;
use crate::core::{ItemStatus, RunStatus, StageStatus, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Processing state of one item in one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    /// Current status.
    pub status: ItemStatus,
    /// Backend attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Backend used on the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendId>,
    /// Wall time from dispatch to terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Usage accounting for the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Last error message; present only on failed items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind label of the last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// True if resolved without invoking a backend.
    #[serde(default)]
    pub fast_path: bool,
    /// Why the item was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// First dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the item became terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Time an operator last reset the item. Item records written before it
    /// are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl ItemState {
    /// Returns true if the item will not be dispatched again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Aggregated execution state of one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    /// Stage status.
    pub status: StageStatus,
    /// Items loaded for the stage.
    #[serde(default)]
    pub total_items: usize,
    /// Items completed.
    #[serde(default)]
    pub completed_items: usize,
    /// Items skipped.
    #[serde(default)]
    pub skipped_items: usize,
    /// Items failed.
    #[serde(default)]
    pub failed_items: usize,
    /// Summed usage of terminal items.
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// When the stage first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-item state keyed by item id.
    #[serde(default)]
    pub items: BTreeMap<String, ItemState>,
}

impl StageState {
    /// Number of items in a terminal state.
    #[must_use]
    pub fn terminal_items(&self) -> usize {
        self.completed_items + self.skipped_items + self.failed_items
    }

    /// Number of fast-path items.
    #[must_use]
    pub fn fast_path_items(&self) -> usize {
        self.items.values().filter(|i| i.fast_path).count()
    }

    /// Rebuilds counters and usage from the item map.
    pub fn recount(&mut self) {
        let items = std::mem::take(&mut self.items);
        self.total_items = items.len();
        self.completed_items = 0;
        self.skipped_items = 0;
        self.failed_items = 0;
        self.token_usage = TokenUsage::default();
        for item in items.values() {
            self.tally(item.status, true);
            if item.is_terminal() {
                if let Some(usage) = item.token_usage {
                    self.token_usage += usage;
                }
            }
        }
        self.items = items;
    }

    /// Adjusts the terminal counters for one item entering or leaving `status`.
    pub(crate) fn tally(&mut self, status: ItemStatus, entering: bool) {
        let counter = match status {
            ItemStatus::Completed => &mut self.completed_items,
            ItemStatus::Skipped => &mut self.skipped_items,
            ItemStatus::Failed => &mut self.failed_items,
            ItemStatus::Pending | ItemStatus::Running => return,
        };
        if entering {
            *counter += 1;
        } else {
            *counter = counter.saturating_sub(1);
        }
    }
}

/// The full, persisted record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Stage names in execution order.
    pub stages: Vec<String>,
    /// Stage currently executing; `None` before start and after completion.
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Run status.
    #[serde(default)]
    pub status: RunStatus,
    /// Per-stage state.
    #[serde(default)]
    pub stage_states: BTreeMap<String, StageState>,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// Run completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Usage summed across all stages.
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl PipelineState {
    /// Creates a fresh run record with every stage pending.
    #[must_use]
    pub fn new(run_id: impl Into<String>, pipeline: impl Into<String>, stages: Vec<String>) -> Self {
        let stage_states = stages
            .iter()
            .map(|name| (name.clone(), StageState::default()))
            .collect();
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            stages,
            current_stage: None,
            status: RunStatus::Running,
            stage_states,
            started_at: Utc::now(),
            completed_at: None,
            token_usage: TokenUsage::default(),
        }
    }

    /// Returns a stage's state.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stage_states.get(name)
    }

    /// Returns true if every stage has completed.
    #[must_use]
    pub fn all_stages_completed(&self) -> bool {
        self.stages.iter().all(|name| {
            self.stage_states
                .get(name)
                .is_some_and(|s| s.status == StageStatus::Completed)
        })
    }

    /// Recomputes the run total from the stage totals.
    pub fn recompute_token_usage(&mut self) {
        self.token_usage = self.stage_states.values().map(|s| s.token_usage).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(status: ItemStatus, tokens: u64) -> ItemState {
        ItemState {
            status,
            token_usage: Some(TokenUsage::new(tokens, 0)),
            ..ItemState::default()
        }
    }

    #[test]
    fn test_recount() {
        let mut stage = StageState::default();
        stage.items.insert("a".into(), item(ItemStatus::Completed, 10));
        stage.items.insert("b".into(), item(ItemStatus::Skipped, 0));
        stage.items.insert("c".into(), item(ItemStatus::Failed, 5));
        stage.items.insert("d".into(), item(ItemStatus::Pending, 99));

        stage.recount();

        assert_eq!(stage.total_items, 4);
        assert_eq!(stage.completed_items, 1);
        assert_eq!(stage.skipped_items, 1);
        assert_eq!(stage.failed_items, 1);
        assert_eq!(stage.terminal_items(), 3);
        assert_eq!(stage.token_usage.input_tokens, 15);
    }

    #[test]
    fn test_new_pipeline_state() {
        let state = PipelineState::new("run-1", "provisions", vec!["extract".into(), "enrich".into()]);

        assert_eq!(state.stage_states.len(), 2);
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.current_stage.is_none());
        assert!(!state.all_stages_completed());
    }

    #[test]
    fn test_state_round_trip_uses_camel_case() {
        let mut state = PipelineState::new("run-1", "p", vec!["s".into()]);
        state
            .stage_states
            .get_mut("s")
            .unwrap()
            .items
            .insert("1".into(), item(ItemStatus::Completed, 3));

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json["stageStates"]["s"].get("totalItems").is_some());
        assert_eq!(json["stageStates"]["s"]["items"]["1"]["status"], "completed");

        let back: PipelineState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
