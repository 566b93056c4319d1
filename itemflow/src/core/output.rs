//! Per-item records and materialized stage outputs.

use super::item::lookup_field;
use super::{ItemStatus, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable record of one item's processing in one stage.
///
/// Written to its own file as soon as the item reaches a terminal state, so
/// results and failure details survive independently of the pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    /// Item id.
    pub item_id: String,
    /// Stage name.
    pub stage: String,
    /// Terminal status.
    pub status: ItemStatus,
    /// Number of backend attempts made.
    pub attempts: u32,
    /// Backend used on the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Wall time spent on the item.
    pub duration_ms: u64,
    /// Summed usage across attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// True if resolved without a backend call.
    #[serde(default)]
    pub fast_path: bool,
    /// Why the item was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Last error message for failed items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind label of the last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// The item's input payload.
    #[serde(default)]
    pub input: serde_json::Value,
    /// The transformation result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// When the item reached its terminal state.
    pub completed_at: DateTime<Utc>,
}

impl ItemRecord {
    /// Returns the record as an output record if it belongs in the stage output.
    ///
    /// Completed items always do; skipped items only when they carry a result.
    #[must_use]
    pub fn to_output(&self) -> Option<OutputRecord> {
        match self.status {
            ItemStatus::Completed | ItemStatus::Skipped => self.result.as_ref().map(|result| OutputRecord {
                item_id: self.item_id.clone(),
                input: self.input.clone(),
                result: result.clone(),
                fast_path: self.fast_path,
            }),
            _ => None,
        }
    }
}

/// One successful (or fast-path) result in a stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    /// Item id.
    pub item_id: String,
    /// The item's input payload.
    #[serde(default)]
    pub input: serde_json::Value,
    /// The transformation result.
    pub result: serde_json::Value,
    /// True if produced without a backend call.
    #[serde(default)]
    pub fast_path: bool,
}

impl OutputRecord {
    /// Looks up a field on the result, falling back to the input payload.
    ///
    /// An explicit `null` on the result counts as absent.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        lookup_field(&self.result, name)
            .filter(|value| !value.is_null())
            .or_else(|| lookup_field(&self.input, name))
    }
}

/// The materialized output of a completed stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    /// Stage name.
    pub stage: String,
    /// Run that produced the output.
    pub run_id: String,
    /// Records in item load order.
    #[serde(default)]
    pub records: Vec<OutputRecord>,
}

impl StageOutput {
    /// Creates an empty output for a stage.
    #[must_use]
    pub fn new(stage: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            run_id: run_id.into(),
            records: Vec::new(),
        }
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the stage produced no usable records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finds a record by item id.
    #[must_use]
    pub fn get(&self, item_id: &str) -> Option<&OutputRecord> {
        self.records.iter().find(|r| r.item_id == item_id)
    }
}
