//! Durable item and stage outputs.
//!
//! Every terminal item is written to its own record as soon as it finishes,
//! independently of the debounced state flush. A completed stage additionally
//! gets one aggregated [`StageOutput`].

mod catalog;
mod file;

pub use catalog::{RunCatalog, RunSummary};
pub use file::{FileOutputStore, RunLayout};

use crate::core::{ItemRecord, StageOutput};
use crate::errors::ItemflowError;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Storage for per-item records and stage outputs of one run.
pub trait OutputStore: Send + Sync {
    /// Writes one item record, replacing any previous one.
    fn write_item(&self, record: &ItemRecord) -> Result<(), ItemflowError>;

    /// Reads one item record.
    fn read_item(&self, stage: &str, item_id: &str) -> Result<Option<ItemRecord>, ItemflowError>;

    /// Writes a stage's aggregated output.
    fn write_stage(&self, output: &StageOutput) -> Result<(), ItemflowError>;

    /// Reads a stage's aggregated output.
    fn read_stage(&self, stage: &str) -> Result<Option<StageOutput>, ItemflowError>;
}

/// In-memory output store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryOutputStore {
    items: RwLock<HashMap<(String, String), ItemRecord>>,
    stages: RwLock<HashMap<String, StageOutput>>,
}

impl MemoryOutputStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of item records written.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }
}

impl OutputStore for MemoryOutputStore {
    fn write_item(&self, record: &ItemRecord) -> Result<(), ItemflowError> {
        self.items
            .write()
            .insert((record.stage.clone(), record.item_id.clone()), record.clone());
        Ok(())
    }

    fn read_item(&self, stage: &str, item_id: &str) -> Result<Option<ItemRecord>, ItemflowError> {
        Ok(self
            .items
            .read()
            .get(&(stage.to_string(), item_id.to_string()))
            .cloned())
    }

    fn write_stage(&self, output: &StageOutput) -> Result<(), ItemflowError> {
        self.stages
            .write()
            .insert(output.stage.clone(), output.clone());
        Ok(())
    }

    fn read_stage(&self, stage: &str) -> Result<Option<StageOutput>, ItemflowError> {
        Ok(self.stages.read().get(stage).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemStatus;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryOutputStore::new();
        let record = ItemRecord {
            item_id: "1".into(),
            stage: "extract".into(),
            status: ItemStatus::Completed,
            attempts: 1,
            backend: Some("default".into()),
            duration_ms: 12,
            token_usage: None,
            fast_path: false,
            skip_reason: None,
            error: None,
            error_kind: None,
            input: json!({"text": "art. 3"}),
            result: Some(json!({"provisions": 1})),
            completed_at: Utc::now(),
        };

        store.write_item(&record).unwrap();

        assert_eq!(store.read_item("extract", "1").unwrap(), Some(record));
        assert_eq!(store.read_item("extract", "2").unwrap(), None);
        assert_eq!(store.item_count(), 1);
        assert!(store.read_stage("extract").unwrap().is_none());
    }
}
