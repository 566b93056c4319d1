//! Run and stage summaries.

use crate::core::{RunStatus, StageStatus, TokenUsage};
use crate::state::StageState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-stage counts reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    /// Stage name.
    pub stage: String,
    /// Stage status.
    pub status: StageStatus,
    /// Items loaded.
    pub total_items: usize,
    /// Items completed.
    pub completed_items: usize,
    /// Items skipped, fast path included.
    pub skipped_items: usize,
    /// Items failed.
    pub failed_items: usize,
    /// Items resolved on the fast path.
    pub fast_path_items: usize,
    /// Records in the materialized output.
    pub output_records: usize,
    /// Summed usage.
    pub token_usage: TokenUsage,
    /// True if the stage was already complete and was not re-run.
    pub resumed: bool,
}

impl StageSummary {
    /// Builds a summary from a stage's state.
    #[must_use]
    pub fn from_state(stage: &str, state: &StageState, output_records: usize, resumed: bool) -> Self {
        Self {
            stage: stage.to_string(),
            status: state.status,
            total_items: state.total_items,
            completed_items: state.completed_items,
            skipped_items: state.skipped_items,
            failed_items: state.failed_items,
            fast_path_items: state.fast_path_items(),
            output_records,
            token_usage: state.token_usage,
            resumed,
        }
    }
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} total, {} completed, {} skipped ({} fast path), {} failed, {} tokens",
            self.stage,
            self.total_items,
            self.completed_items,
            self.skipped_items,
            self.fast_path_items,
            self.failed_items,
            self.token_usage.total_tokens()
        )?;
        if self.resumed {
            write!(f, " [resumed]")?;
        }
        Ok(())
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: String,
    /// Run status.
    pub status: RunStatus,
    /// True if the run continued persisted state.
    pub resumed: bool,
    /// Per-stage summaries in execution order.
    pub stages: Vec<StageSummary>,
    /// Usage across all stages.
    pub token_usage: TokenUsage,
    /// Wall time of this invocation.
    pub duration_ms: u64,
}

impl RunReport {
    /// Summary of one stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Failed items across all stages.
    #[must_use]
    pub fn failed_items(&self) -> usize {
        self.stages.iter().map(|s| s.failed_items).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemStatus;
    use crate::state::ItemState;

    #[test]
    fn test_summary_from_state() {
        let mut state = StageState::default();
        state.items.insert(
            "1".into(),
            ItemState {
                status: ItemStatus::Skipped,
                fast_path: true,
                ..ItemState::default()
            },
        );
        state.items.insert(
            "2".into(),
            ItemState {
                status: ItemStatus::Failed,
                ..ItemState::default()
            },
        );
        state.recount();
        state.status = StageStatus::Completed;

        let summary = StageSummary::from_state("extract", &state, 1, false);

        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.fast_path_items, 1);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(
            summary.to_string(),
            "extract: 2 total, 0 completed, 1 skipped (1 fast path), 1 failed, 0 tokens"
        );
    }
}
