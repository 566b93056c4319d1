//! Pipeline builder with validation.

use super::orchestrator::Pipeline;
use crate::config::EngineConfig;
use crate::dependencies::DependencySource;
use crate::errors::{ItemflowError, PipelineValidationError};
use crate::events::{EventSink, LoggingEventSink};
use crate::stages::Stage;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Stages run in the order they are added. A same-run dependency may only
/// name a stage added earlier.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    config: EngineConfig,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            config: EngineConfig::default(),
            events: None,
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is empty or taken, or if one of its
    /// dependency declarations is malformed.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Result<Self, PipelineValidationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Appends a stage in place.
    ///
    /// # Errors
    ///
    /// See [`PipelineBuilder::stage`].
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Result<(), PipelineValidationError> {
        let name = stage.name().to_string();
        if name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty")
                .with_fix_hint("Return a non-empty name from Stage::name."));
        }
        if self.stages.iter().any(|s| s.name() == name) {
            return Err(
                PipelineValidationError::new(format!("Duplicate stage name '{name}'"))
                    .with_stages(vec![name])
                    .with_fix_hint("Stage names identify state and output files and must be unique."),
            );
        }

        let mut dep_names = HashSet::new();
        for dep in stage.dependencies() {
            if !dep_names.insert(dep.name.clone()) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{name}' declares dependency '{}' twice",
                    dep.name
                ))
                .with_stages(vec![name])
                .with_fix_hint("Give each declaration a distinct name with `named`."));
            }
            if dep.keys.is_empty() {
                return Err(PipelineValidationError::new(format!(
                    "Dependency '{}' of stage '{name}' has no key fields",
                    dep.name
                ))
                .with_stages(vec![name, dep.stage])
                .with_fix_hint("Add at least one key pair with `with_key`."));
            }
            if dep.source == DependencySource::SameRun
                && !self.stages.iter().any(|s| s.name() == dep.stage)
            {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{name}' depends on '{}', which does not run before it",
                    dep.stage
                ))
                .with_stages(vec![name, dep.stage])
                .with_fix_hint("Add the upstream stage first, or read it from a prior run."));
            }
        }

        self.stages.push(stage);
        Ok(())
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink. Defaults to a [`LoggingEventSink`].
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages or the configuration is
    /// invalid.
    pub fn build(self) -> Result<Pipeline, ItemflowError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Pipeline name cannot be empty").into());
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_fix_hint("Add at least one stage to the pipeline before building.")
                .into());
        }
        self.config.validate()?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));
        Ok(Pipeline::new(self.name, self.stages, self.config, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::{DependencyDeclaration, RunSelector};
    use crate::testing::ScriptedStage;

    fn stage(name: &str) -> Arc<dyn Stage> {
        Arc::new(ScriptedStage::new(name, 1))
    }

    #[test]
    fn test_builds_in_order() {
        let pipeline = PipelineBuilder::new("provisions")
            .stage(stage("extract"))
            .unwrap()
            .stage(stage("enrich"))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(pipeline.stage_names(), vec!["extract", "enrich"]);
    }

    #[test]
    fn test_rejects_duplicate_stage() {
        let err = PipelineBuilder::new("p")
            .stage(stage("extract"))
            .unwrap()
            .stage(stage("extract"))
            .unwrap_err();

        assert!(err.message.contains("Duplicate"));
        assert_eq!(err.stages, vec!["extract".to_string()]);
    }

    #[test]
    fn test_rejects_forward_same_run_dependency() {
        let enrich = ScriptedStage::new("enrich", 1)
            .with_dependency(DependencyDeclaration::same_run("extract").with_key("id", "id"));

        let err = PipelineBuilder::new("p").stage(Arc::new(enrich)).unwrap_err();

        assert!(err.message.contains("does not run before it"));
    }

    #[test]
    fn test_rejects_keyless_dependency() {
        let enrich = ScriptedStage::new("enrich", 1)
            .with_dependency(DependencyDeclaration::same_run("extract"));

        let err = PipelineBuilder::new("p")
            .stage(stage("extract"))
            .unwrap()
            .stage(Arc::new(enrich))
            .unwrap_err();

        assert!(err.message.contains("no key fields"));
    }

    #[test]
    fn test_prior_run_dependency_may_name_any_stage() {
        let enrich = ScriptedStage::new("enrich", 1).with_dependency(
            DependencyDeclaration::prior_run("enrich", RunSelector::LatestCompleted)
                .with_key("id", "id"),
        );

        assert!(PipelineBuilder::new("p").stage(Arc::new(enrich)).is_ok());
    }

    #[test]
    fn test_empty_pipeline_fails() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert!(matches!(err, ItemflowError::Validation(_)));
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let err = PipelineBuilder::new("p")
            .stage(stage("extract"))
            .unwrap()
            .with_config(EngineConfig::default().with_concurrency(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ItemflowError::Config(_)));
    }
}
