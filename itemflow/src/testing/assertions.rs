//! Test assertions for run reports and item state.

use crate::core::ItemStatus;
use crate::pipeline::RunReport;
use crate::state::StateStore;

/// Asserts a stage's completed, skipped and failed counts.
pub fn assert_stage_counts(
    report: &RunReport,
    stage: &str,
    completed: usize,
    skipped: usize,
    failed: usize,
) {
    let summary = report
        .stage(stage)
        .unwrap_or_else(|| panic!("No stage '{stage}' in report"));
    assert_eq!(
        (summary.completed_items, summary.skipped_items, summary.failed_items),
        (completed, skipped, failed),
        "Unexpected (completed, skipped, failed) for stage '{stage}'"
    );
    assert_eq!(
        summary.completed_items + summary.skipped_items + summary.failed_items,
        summary.total_items,
        "Terminal counts of stage '{stage}' do not add up to its total"
    );
}

/// Asserts an item's status and attempt count.
pub fn assert_item(store: &StateStore, stage: &str, item_id: &str, status: ItemStatus, attempts: u32) {
    let state = store
        .get(stage, item_id)
        .unwrap_or_else(|| panic!("No state for item '{item_id}' in stage '{stage}'"));
    assert_eq!(
        (state.status, state.attempts),
        (status, attempts),
        "Unexpected (status, attempts) for item '{item_id}' in stage '{stage}'"
    );
}
