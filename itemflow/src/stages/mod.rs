//! The stage trait.
//!
//! A stage supplies the parts of a pipeline step that the engine treats as
//! opaque: loading its work items, an optional deterministic preprocessing
//! step, and the backend-driven transform. Scheduling, retries, state and
//! output handling are done by the engine.

use crate::backend::BackendId;
use crate::core::{StageOutput, WorkItem};
use crate::dependencies::{DependencyDeclaration, ResolvedDependencies};
use crate::errors::BackendError;
use crate::pipeline::{Preprocessed, RetryPolicy, TransformOutput};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// What a stage's loader can see.
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    /// The current run.
    pub run_id: &'a str,
    /// The stage being loaded.
    pub stage: &'a str,
    /// Outputs of the stages that already ran in this run.
    pub upstream: &'a HashMap<String, Arc<StageOutput>>,
}

impl LoadContext<'_> {
    /// Output of an earlier stage of this run.
    #[must_use]
    pub fn upstream(&self, stage: &str) -> Option<&StageOutput> {
        self.upstream.get(stage).map(AsRef::as_ref)
    }
}

/// One named step of a pipeline.
///
/// Transforms must be idempotent: the same item may be transformed more
/// than once across attempts and resumed runs.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Stage name, unique within the pipeline.
    fn name(&self) -> &str;

    /// Upstream outputs this stage joins against.
    fn dependencies(&self) -> Vec<DependencyDeclaration> {
        Vec::new()
    }

    /// Preferred concurrency ceiling.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Preferred retry policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Loads the stage's work items. An error aborts the run.
    async fn load_items(&self, ctx: &LoadContext<'_>) -> anyhow::Result<Vec<WorkItem>>;

    /// Decides whether the item needs the backend at all.
    ///
    /// Without declared dependencies the default sends the payload to the
    /// transform unchanged. Otherwise the input is
    /// `{"input": <payload>, "deps": {<name>: <result or null>}}`.
    async fn preprocess(&self, item: &WorkItem, deps: &ResolvedDependencies) -> Preprocessed {
        if deps.is_empty() {
            return Preprocessed::proceed(item.payload.clone());
        }
        Preprocessed::proceed(json!({
            "input": item.payload,
            "deps": deps.to_value(),
        }))
    }

    /// Transforms one input with the given backend.
    async fn transform(
        &self,
        input: Value,
        backend: &BackendId,
    ) -> Result<TransformOutput, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputRecord;
    use crate::dependencies::DependencyResolver;

    #[derive(Debug)]
    struct Passthrough;

    #[async_trait]
    impl Stage for Passthrough {
        fn name(&self) -> &str {
            "enrich"
        }

        async fn load_items(&self, _ctx: &LoadContext<'_>) -> anyhow::Result<Vec<WorkItem>> {
            Ok(Vec::new())
        }

        async fn transform(
            &self,
            input: Value,
            _backend: &BackendId,
        ) -> Result<TransformOutput, BackendError> {
            Ok(TransformOutput::new(input))
        }
    }

    fn input_of(prepared: Preprocessed) -> Value {
        match prepared {
            Preprocessed::Proceed { input } => input,
            Preprocessed::Skip { reason, .. } => panic!("unexpected skip: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_default_preprocess_without_dependencies() {
        let item = WorkItem::new("1", json!({"text": "art. 5"}));

        let prepared = Passthrough
            .preprocess(&item, &ResolvedDependencies::default())
            .await;

        assert_eq!(input_of(prepared), json!({"text": "art. 5"}));
    }

    #[tokio::test]
    async fn test_default_preprocess_carries_dependencies() {
        let mut upstream = StageOutput::new("extract", "run-1");
        upstream.records.push(OutputRecord {
            item_id: "u1".into(),
            input: json!({}),
            result: json!({"id": "1", "article": "5"}),
            fast_path: false,
        });
        let mut materialized = HashMap::new();
        materialized.insert("extract".to_string(), Arc::new(upstream));
        let declarations = [
            DependencyDeclaration::same_run("extract").with_key("id", "id"),
            DependencyDeclaration::same_run("extract")
                .with_key("other", "id")
                .named("sibling")
                .optional(),
        ];
        let resolver =
            DependencyResolver::build("enrich", &declarations, &materialized, None).unwrap();
        let item = WorkItem::new("1", json!({"id": "1", "other": "9"}));
        let deps = resolver.resolve(&item).unwrap();

        let prepared = Passthrough.preprocess(&item, &deps).await;

        assert_eq!(
            input_of(prepared),
            json!({
                "input": {"id": "1", "other": "9"},
                "deps": {"extract": {"id": "1", "article": "5"}, "sibling": null},
            })
        );
    }
}
