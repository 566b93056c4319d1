//! Cross-stage and cross-run dependency joins.
//!
//! A stage declares which upstream outputs it needs and how to match them:
//! an ordered list of `(local field, remote field)` pairs forms a composite
//! key. Each upstream output is indexed once by that key, and every item is
//! resolved with a single hash lookup per declaration.

use crate::core::{OutputRecord, StageOutput, WorkItem};
use crate::errors::ItemflowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One part of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Field on the consuming item's payload.
    pub local: String,
    /// Field on the upstream record (result first, then input).
    pub remote: String,
}

impl KeyPair {
    /// Creates a key pair.
    #[must_use]
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Picks which prior run to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSelector {
    /// The most recently started run whose status is completed.
    LatestCompleted,
    /// A specific run.
    RunId(String),
}

impl fmt::Display for RunSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatestCompleted => write!(f, "latest completed run"),
            Self::RunId(id) => write!(f, "run {id}"),
        }
    }
}

/// Where a dependency's records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    /// An earlier stage of the current run.
    SameRun,
    /// A stage output persisted by another run of the same pipeline.
    PriorRun(RunSelector),
}

/// A stage's declaration that it needs another stage's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    /// Name the resolved record is exposed under.
    pub name: String,
    /// Upstream stage.
    pub stage: String,
    /// Composite key, matched jointly.
    pub keys: Vec<KeyPair>,
    /// If true, items without a match are skipped as unprocessable.
    pub required: bool,
    /// Where the upstream output lives.
    pub source: DependencySource,
}

impl DependencyDeclaration {
    /// Declares a required dependency on an earlier stage of the same run.
    #[must_use]
    pub fn same_run(stage: impl Into<String>) -> Self {
        let stage = stage.into();
        Self {
            name: stage.clone(),
            stage,
            keys: Vec::new(),
            required: true,
            source: DependencySource::SameRun,
        }
    }

    /// Declares a required dependency on a stage of a prior run.
    #[must_use]
    pub fn prior_run(stage: impl Into<String>, selector: RunSelector) -> Self {
        Self {
            source: DependencySource::PriorRun(selector),
            ..Self::same_run(stage)
        }
    }

    /// Appends a key pair.
    #[must_use]
    pub fn with_key(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.keys.push(KeyPair::new(local, remote));
        self
    }

    /// Sets the name the dependency is exposed under.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Makes the dependency optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// One typed component of a [`CompositeKey`].
///
/// Parts of different JSON types never compare equal. Numbers compare by
/// value, so `1` and `1.0` match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// A string value.
    Text(String),
    /// A number in canonical form.
    Number(String),
    /// A boolean.
    Bool(bool),
    /// An object or array, by its JSON encoding.
    Json(String),
}

impl KeyPart {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(Self::Number(canonical_number(n))),
            other => Some(Self::Json(other.to_string())),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn canonical_number(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) | Self::Number(s) | Self::Json(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Normalized composite key.
///
/// A null or missing part yields no key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey(Vec<KeyPart>);

impl CompositeKey {
    /// Builds a key from field values in declaration order.
    pub fn from_values<'a, I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = Option<&'a Value>>,
    {
        values
            .into_iter()
            .map(|value| KeyPart::from_value(value?))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Key parts.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Hash index over one upstream output.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    run_id: String,
    by_key: HashMap<CompositeKey, Arc<OutputRecord>>,
    unkeyed: usize,
    duplicates: usize,
}

impl DependencyIndex {
    /// Indexes `output` by the remote side of `keys`.
    ///
    /// Records with a missing key part are left out; on duplicate keys the
    /// first record in output order wins.
    #[must_use]
    pub fn build(keys: &[KeyPair], output: &StageOutput) -> Self {
        let mut index = Self {
            run_id: output.run_id.clone(),
            ..Self::default()
        };
        for record in &output.records {
            let Some(key) = CompositeKey::from_values(keys.iter().map(|k| record.field(&k.remote)))
            else {
                index.unkeyed += 1;
                continue;
            };
            match index.by_key.entry(key) {
                std::collections::hash_map::Entry::Occupied(existing) => {
                    index.duplicates += 1;
                    debug!(
                        stage = %output.stage,
                        key = %existing.key(),
                        kept = %existing.get().item_id,
                        dropped = %record.item_id,
                        "Duplicate dependency key"
                    );
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Arc::new(record.clone()));
                }
            }
        }
        if index.duplicates > 0 {
            warn!(
                stage = %output.stage,
                duplicates = index.duplicates,
                "Dependency output has duplicate keys; first record kept"
            );
        }
        index
    }

    /// Finds the record for a key.
    #[must_use]
    pub fn get(&self, key: &CompositeKey) -> Option<&Arc<OutputRecord>> {
        self.by_key.get(key)
    }

    /// Number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Records dropped because a later record repeated their key.
    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Records left out because a key part was missing.
    #[must_use]
    pub fn unkeyed(&self) -> usize {
        self.unkeyed
    }

    /// Run that produced the indexed output.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Reads stage outputs persisted by other runs.
pub trait PriorRunSource: Send + Sync {
    /// Loads `stage`'s output from the run picked by `selector`.
    fn load_stage_output(
        &self,
        stage: &str,
        selector: &RunSelector,
    ) -> Result<StageOutput, ItemflowError>;
}

/// Why an item cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unprocessable {
    /// Dependency that failed to resolve.
    pub dependency: String,
    /// Item-side key, if one could be built.
    pub key: Option<CompositeKey>,
}

impl fmt::Display for Unprocessable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(
                f,
                "required dependency '{}' has no record for key {key}",
                self.dependency
            ),
            None => write!(
                f,
                "required dependency '{}' cannot be matched: key field missing",
                self.dependency
            ),
        }
    }
}

/// Dependencies resolved for one item.
///
/// Optional dependencies without a match are present with no record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDependencies {
    entries: BTreeMap<String, Option<Arc<OutputRecord>>>,
}

impl ResolvedDependencies {
    /// The matched record, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputRecord> {
        self.entries.get(name).and_then(|r| r.as_deref())
    }

    /// Returns true if the dependency was declared and had no match.
    #[must_use]
    pub fn is_no_data(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(None))
    }

    /// Number of declared dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the stage declared no dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the resolution as JSON, with `null` for "no data".
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(name, record)| {
                    let value = record
                        .as_ref()
                        .map_or(Value::Null, |r| r.result.clone());
                    (name.clone(), value)
                })
                .collect(),
        )
    }
}

/// Resolves every declared dependency of one stage.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    bindings: Vec<(DependencyDeclaration, DependencyIndex)>,
}

impl DependencyResolver {
    /// Creates a resolver from prebuilt indexes.
    #[must_use]
    pub fn new(bindings: Vec<(DependencyDeclaration, DependencyIndex)>) -> Self {
        Self { bindings }
    }

    /// Builds indexes for `declarations` of `stage`.
    ///
    /// Same-run sources come from `materialized`; prior-run sources are read
    /// through `prior`. A source that cannot be located is an error.
    pub fn build(
        stage: &str,
        declarations: &[DependencyDeclaration],
        materialized: &HashMap<String, Arc<StageOutput>>,
        prior: Option<&dyn PriorRunSource>,
    ) -> Result<Self, ItemflowError> {
        let mut bindings = Vec::with_capacity(declarations.len());
        for decl in declarations {
            let index = match &decl.source {
                DependencySource::SameRun => {
                    let output = materialized.get(&decl.stage).ok_or_else(|| {
                        ItemflowError::dependency_unavailable(
                            stage,
                            &decl.stage,
                            "stage has not been materialized in this run",
                        )
                    })?;
                    DependencyIndex::build(&decl.keys, output)
                }
                DependencySource::PriorRun(selector) => {
                    let prior = prior.ok_or_else(|| {
                        ItemflowError::dependency_unavailable(
                            stage,
                            &decl.stage,
                            "no run catalog is configured",
                        )
                    })?;
                    let output = prior.load_stage_output(&decl.stage, selector)?;
                    DependencyIndex::build(&decl.keys, &output)
                }
            };
            debug!(
                stage,
                dependency = %decl.name,
                source_run = index.run_id(),
                keys = index.len(),
                "Dependency index built"
            );
            bindings.push((decl.clone(), index));
        }
        Ok(Self { bindings })
    }

    /// Resolves all dependencies of `item`.
    ///
    /// Fails on the first required dependency without a match.
    pub fn resolve(&self, item: &WorkItem) -> Result<ResolvedDependencies, Unprocessable> {
        let mut resolved = ResolvedDependencies::default();
        for (decl, index) in &self.bindings {
            let key = CompositeKey::from_values(decl.keys.iter().map(|k| item.field(&k.local)));
            let record = key.as_ref().and_then(|k| index.get(k)).cloned();
            if record.is_none() && decl.required {
                return Err(Unprocessable {
                    dependency: decl.name.clone(),
                    key,
                });
            }
            resolved.entries.insert(decl.name.clone(), record);
        }
        Ok(resolved)
    }

    /// Number of declared dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if there is nothing to resolve.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
