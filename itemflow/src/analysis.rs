//! Post-run summaries over a stage output.

use crate::core::{OutputRecord, StageOutput};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A record and the length of the array field it was ranked by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRecord {
    /// Item id.
    pub item_id: String,
    /// Length of the ranked field, 0 if absent or not an array.
    pub count: usize,
}

/// Totals of an array field across a stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldStats {
    /// Field that was counted.
    pub field: String,
    /// Records examined.
    pub records: usize,
    /// Summed array lengths.
    pub total: usize,
    /// Mean array length, 0 for an empty output.
    pub average: f64,
    /// Longest array seen.
    pub max: usize,
}

impl fmt::Display for FieldStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} records, {} total, {:.2} average, {} max",
            self.field, self.records, self.total, self.average, self.max
        )
    }
}

fn field_len(record: &OutputRecord, field: &str) -> usize {
    record
        .field(field)
        .and_then(serde_json::Value::as_array)
        .map_or(0, Vec::len)
}

/// Returns the `n` records with the longest `field` arrays, longest first.
///
/// Ties keep output order.
#[must_use]
pub fn rank_by_len(output: &StageOutput, field: &str, n: usize) -> Vec<RankedRecord> {
    let mut ranked: Vec<RankedRecord> = output
        .records
        .iter()
        .map(|record| RankedRecord {
            item_id: record.item_id.clone(),
            count: field_len(record, field),
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(n);
    ranked
}

/// Counts the lengths of `field` arrays across every record.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn field_stats(output: &StageOutput, field: &str) -> FieldStats {
    let counts: Vec<usize> = output.records.iter().map(|r| field_len(r, field)).collect();
    let total: usize = counts.iter().sum();
    let average = if counts.is_empty() {
        0.0
    } else {
        total as f64 / counts.len() as f64
    };
    FieldStats {
        field: field.to_string(),
        records: counts.len(),
        total,
        average,
        max: counts.iter().copied().max().unwrap_or(0),
    }
}
