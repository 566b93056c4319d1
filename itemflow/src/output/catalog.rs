//! Discovery of persisted runs.

use super::file::{read_json_opt, RunLayout};
use super::{FileOutputStore, OutputStore};
use crate::core::{RunStatus, StageOutput, StageStatus};
use crate::dependencies::{PriorRunSource, RunSelector};
use crate::errors::ItemflowError;
use crate::state::PipelineState;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Summary of one persisted run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Run id.
    pub run_id: String,
    /// Run status.
    pub status: RunStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Stages that completed in the run.
    pub completed_stages: Vec<String>,
}

/// Lists runs of one pipeline under an output root.
#[derive(Debug, Clone)]
pub struct RunCatalog {
    root: PathBuf,
    pipeline: String,
    exclude: Option<String>,
}

impl RunCatalog {
    /// Creates a catalog for `pipeline` under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, pipeline: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pipeline: pipeline.into(),
            exclude: None,
        }
    }

    /// Hides a run from listings, typically the one currently executing.
    #[must_use]
    pub fn excluding(mut self, run_id: impl Into<String>) -> Self {
        self.exclude = Some(run_id.into());
        self
    }

    /// Output root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the layout of a run in this catalog.
    #[must_use]
    pub fn layout(&self, run_id: &str) -> RunLayout {
        RunLayout::new(&self.root, &self.pipeline, run_id)
    }

    /// Lists persisted runs, oldest first.
    ///
    /// Directories without a readable state file are skipped.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, ItemflowError> {
        let pipeline_dir = RunLayout::pipeline_dir(&self.root, &self.pipeline);
        let entries = match std::fs::read_dir(&pipeline_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let path = entry?.path().join(super::file::STATE_FILE);
            let state: PipelineState = match read_json_opt(&path) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable run state");
                    continue;
                }
            };
            if state.pipeline != self.pipeline || self.exclude.as_deref() == Some(state.run_id.as_str()) {
                continue;
            }
            let completed_stages = state
                .stages
                .iter()
                .filter(|s| {
                    state
                        .stage(s)
                        .is_some_and(|st| st.status == StageStatus::Completed)
                })
                .cloned()
                .collect();
            runs.push(RunSummary {
                run_id: state.run_id,
                status: state.status,
                started_at: state.started_at,
                completed_at: state.completed_at,
                completed_stages,
            });
        }
        runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    /// Resolves a selector to a run id.
    pub fn select(&self, selector: &RunSelector) -> Result<Option<String>, ItemflowError> {
        let runs = self.list_runs()?;
        Ok(match selector {
            RunSelector::LatestCompleted => runs
                .into_iter()
                .rev()
                .find(|r| r.status == RunStatus::Completed)
                .map(|r| r.run_id),
            RunSelector::RunId(id) => runs.into_iter().find(|r| &r.run_id == id).map(|r| r.run_id),
        })
    }
}

impl PriorRunSource for RunCatalog {
    fn load_stage_output(
        &self,
        stage: &str,
        selector: &RunSelector,
    ) -> Result<StageOutput, ItemflowError> {
        let run_id = self.select(selector)?.ok_or_else(|| {
            ItemflowError::dependency_unavailable(
                stage,
                stage,
                format!("no {selector} of pipeline '{}'", self.pipeline),
            )
        })?;
        FileOutputStore::new(self.layout(&run_id))
            .read_stage(stage)?
            .ok_or_else(|| {
                ItemflowError::dependency_unavailable(
                    stage,
                    stage,
                    format!("run {run_id} has no completed output for this stage"),
                )
            })
    }
}
