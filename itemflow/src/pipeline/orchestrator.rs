//! Sequential execution of a pipeline's stages.

use super::builder::PipelineBuilder;
use super::report::RunReport;
use super::runner::{RunContext, StageRunner};
use crate::config::EngineConfig;
use crate::core::{RunStatus, StageOutput};
use crate::dependencies::PriorRunSource;
use crate::errors::ItemflowError;
use crate::events::{event_types, EventSink};
use crate::observability::{run_span, stage_span, SpanTimer};
use crate::output::{FileOutputStore, MemoryOutputStore, OutputStore, RunCatalog, RunLayout};
use crate::stages::Stage;
use crate::state::{PipelineState, StateStore};
use crate::utils::generate_run_id;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Instrument};

/// A validated, ordered list of stages.
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub(super) fn new(
        name: String,
        stages: Vec<Arc<dyn Stage>>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name,
            stages,
            config,
            events,
        }
    }

    /// Starts building a pipeline.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a new run under the configured output root.
    pub fn new_session(&self) -> Result<RunSession, ItemflowError> {
        RunSession::create(self, &self.config.output_root)
    }

    /// Runs every stage in order.
    ///
    /// Stages already completed in the session's state are not re-run;
    /// their recorded outputs feed later stages. An error from any stage
    /// stops the run with its progress persisted.
    pub async fn run(&self, session: &RunSession) -> Result<RunReport, ItemflowError> {
        let run_id = session.run_id().to_string();
        self.run_stages(session, &run_id)
            .instrument(run_span(&self.name, &run_id))
            .await
    }

    async fn run_stages(&self, session: &RunSession, run_id: &str) -> Result<RunReport, ItemflowError> {
        let timer = SpanTimer::start();
        let started_event = if session.resumed {
            event_types::PIPELINE_RESUMED
        } else {
            event_types::PIPELINE_STARTED
        };
        info!(pipeline = %self.name, run_id, resumed = session.resumed, "Pipeline run starting");
        self.events
            .emit(
                started_event,
                Some(json!({
                    "pipeline": self.name,
                    "run_id": run_id,
                    "stages": self.stage_names(),
                })),
            )
            .await;

        let mut materialized: HashMap<String, Arc<StageOutput>> = HashMap::new();
        let mut summaries = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let name = stage.name();
            let runner = StageRunner::new(
                stage.as_ref(),
                self.config.retry_for(name, stage.retry_policy()),
                self.config.concurrency_for(name, stage.concurrency()),
                self.config.flush_policy(),
            );
            let ctx = RunContext {
                run_id,
                store: &session.store,
                outputs: session.outputs.as_ref(),
                events: self.events.as_ref(),
                materialized: &materialized,
                prior_runs: session.catalog.as_ref().map(|c| c as &dyn PriorRunSource),
            };
            let stage_run = runner.run(ctx).instrument(stage_span(name)).await?;
            materialized.insert(name.to_string(), stage_run.output);
            summaries.push(stage_run.summary);
        }

        if session.store.run_status() != RunStatus::Completed {
            session.store.finalize();
        }
        session.store.persist()?;
        let state = session.store.snapshot();

        let report = RunReport {
            pipeline: self.name.clone(),
            run_id: run_id.to_string(),
            status: state.status,
            resumed: session.resumed,
            stages: summaries,
            token_usage: state.token_usage,
            duration_ms: timer.elapsed_ms(),
        };
        info!(
            run_id,
            failed_items = report.failed_items(),
            total_tokens = report.token_usage.total_tokens(),
            duration_ms = report.duration_ms,
            "Pipeline run completed"
        );
        self.events
            .emit(
                event_types::PIPELINE_COMPLETED,
                Some(json!({
                    "pipeline": self.name,
                    "run_id": run_id,
                    "failed_items": report.failed_items(),
                    "total_tokens": report.token_usage.total_tokens(),
                    "duration_ms": report.duration_ms,
                })),
            )
            .await;
        Ok(report)
    }
}

/// The state, outputs and run catalog of one run.
pub struct RunSession {
    store: StateStore,
    outputs: Arc<dyn OutputStore>,
    catalog: Option<RunCatalog>,
    layout: Option<RunLayout>,
    resumed: bool,
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("run_id", &self.run_id())
            .field("layout", &self.layout)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

impl RunSession {
    /// Starts a new run with a generated id under `root`.
    pub fn create(pipeline: &Pipeline, root: impl AsRef<Path>) -> Result<Self, ItemflowError> {
        Self::create_with_id(pipeline, root, generate_run_id())
    }

    /// Starts a new run with a caller-chosen id.
    ///
    /// Fails if the run directory already holds state.
    pub fn create_with_id(
        pipeline: &Pipeline,
        root: impl AsRef<Path>,
        run_id: impl Into<String>,
    ) -> Result<Self, ItemflowError> {
        let root = root.as_ref();
        let run_id = run_id.into();
        let layout = RunLayout::new(root, pipeline.name(), &run_id);
        if layout.state_path().exists() {
            return Err(ItemflowError::Config(format!(
                "run '{run_id}' already exists; resume it instead"
            )));
        }
        let stages = pipeline.stage_names().into_iter().map(String::from).collect();
        let state = PipelineState::new(&run_id, pipeline.name(), stages);
        let store = StateStore::create(layout.state_path(), state)?;
        info!(run_id = %run_id, dir = %layout.dir().display(), "Created run");
        Ok(Self {
            store,
            outputs: Arc::new(FileOutputStore::new(layout.clone())),
            catalog: Some(RunCatalog::new(root, pipeline.name()).excluding(&run_id)),
            layout: Some(layout),
            resumed: false,
        })
    }

    /// Reopens a persisted run.
    pub fn resume(
        pipeline: &Pipeline,
        root: impl AsRef<Path>,
        run_id: &str,
    ) -> Result<Self, ItemflowError> {
        let root = root.as_ref();
        let layout = RunLayout::new(root, pipeline.name(), run_id);
        let stages: Vec<String> = pipeline.stage_names().into_iter().map(String::from).collect();
        let store = StateStore::open(layout.state_path(), pipeline.name(), &stages)?;
        info!(run_id, dir = %layout.dir().display(), "Resuming run");
        Ok(Self {
            store,
            outputs: Arc::new(FileOutputStore::new(layout.clone())),
            catalog: Some(RunCatalog::new(root, pipeline.name()).excluding(run_id)),
            layout: Some(layout),
            resumed: true,
        })
    }

    /// A run that keeps everything in memory. Prior-run dependencies are
    /// unavailable.
    #[must_use]
    pub fn in_memory(pipeline: &Pipeline) -> Self {
        let stages = pipeline.stage_names().into_iter().map(String::from).collect();
        let state = PipelineState::new(generate_run_id(), pipeline.name(), stages);
        Self {
            store: StateStore::in_memory(state),
            outputs: Arc::new(MemoryOutputStore::new()),
            catalog: None,
            layout: None,
            resumed: false,
        }
    }

    /// Replaces the output store.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Arc<dyn OutputStore>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.store.run_id()
    }

    /// Item state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Output store.
    #[must_use]
    pub fn outputs(&self) -> &dyn OutputStore {
        self.outputs.as_ref()
    }

    /// On-disk layout, for file-backed runs.
    #[must_use]
    pub fn layout(&self) -> Option<&RunLayout> {
        self.layout.as_ref()
    }

    /// True if the session continues persisted state.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}
