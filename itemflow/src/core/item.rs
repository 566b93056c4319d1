//! Work items scheduled within a stage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One unit of work within a stage.
///
/// The engine only looks at `id`; the payload is handed to the stage's own
/// preprocessing and transformation logic, and its top-level fields are
/// available to dependency joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier, unique within the stage.
    pub id: String,
    /// Input payload for the stage's transformation.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    /// Creates a new work item.
    #[must_use]
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Looks up a payload field. Dotted names walk nested objects.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        lookup_field(&self.payload, name)
    }

    /// Derives a stable id for a sub-item fanned out of `parent`.
    ///
    /// The same parent and parts always produce the same id, so resumed runs
    /// recognise sub-items they have already processed.
    #[must_use]
    pub fn derived_id(parent: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        format!("{parent}:{}", hex::encode(&digest[..8]))
    }
}

/// Resolves `name` against a JSON object, descending on `.` separators.
pub(crate) fn lookup_field<'a>(
    value: &'a serde_json::Value,
    name: &str,
) -> Option<&'a serde_json::Value> {
    if let Some(found) = value.get(name) {
        return Some(found);
    }
    if !name.contains('.') {
        return None;
    }
    name.split('.').try_fold(value, |current, segment| current.get(segment))
}
