//! Filesystem layout of a run.

use super::OutputStore;
use crate::core::{ItemRecord, StageOutput};
use crate::errors::ItemflowError;
use crate::state::write_json_atomic;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File name of the persisted pipeline state inside a run directory.
pub const STATE_FILE: &str = "pipeline-state.json";

/// File name of a stage's aggregated output.
pub const STAGE_OUTPUT_FILE: &str = "stage-output.json";

/// Paths inside one run directory.
///
/// ```text
/// <root>/<pipeline>/<run_id>/pipeline-state.json
/// <root>/<pipeline>/<run_id>/<stage>/stage-output.json
/// <root>/<pipeline>/<run_id>/<stage>/items/<item>.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    dir: PathBuf,
}

impl RunLayout {
    /// Layout for `run_id` of `pipeline` under `root`.
    #[must_use]
    pub fn new(root: &Path, pipeline: &str, run_id: &str) -> Self {
        Self {
            dir: Self::pipeline_dir(root, pipeline).join(file_component(run_id).as_ref()),
        }
    }

    /// Directory holding every run of `pipeline`.
    #[must_use]
    pub fn pipeline_dir(root: &Path, pipeline: &str) -> PathBuf {
        root.join(file_component(pipeline).as_ref())
    }

    /// The run directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the persisted pipeline state.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Directory of one stage.
    #[must_use]
    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.dir.join(file_component(stage).as_ref())
    }

    /// Path of a stage's aggregated output.
    #[must_use]
    pub fn stage_output_path(&self, stage: &str) -> PathBuf {
        self.stage_dir(stage).join(STAGE_OUTPUT_FILE)
    }

    /// Path of one item record.
    #[must_use]
    pub fn item_path(&self, stage: &str, item_id: &str) -> PathBuf {
        self.stage_dir(stage)
            .join("items")
            .join(format!("{}.json", file_component(item_id)))
    }
}

/// Maps an arbitrary id to a safe, unique file name component.
///
/// Ids made only of `[A-Za-z0-9._-]` that do not start with `.` are used
/// as is; anything else is sanitized and suffixed with a short hash of the
/// original id.
fn file_component(id: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if !id.is_empty() && !id.starts_with('.') && id.chars().all(safe) {
        return Cow::Borrowed(id);
    }
    let sanitized: String = id
        .chars()
        .map(|c| if safe(c) && c != '.' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(id.as_bytes());
    Cow::Owned(format!("{sanitized}-{}", hex::encode(&digest[..4])))
}

/// Reads a JSON file, returning `None` if it does not exist.
pub(crate) fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ItemflowError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Output store writing one JSON file per item and per stage.
#[derive(Debug, Clone)]
pub struct FileOutputStore {
    layout: RunLayout,
}

impl FileOutputStore {
    /// Creates a store over a run layout.
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// The run layout.
    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }
}

impl OutputStore for FileOutputStore {
    fn write_item(&self, record: &ItemRecord) -> Result<(), ItemflowError> {
        write_json_atomic(&self.layout.item_path(&record.stage, &record.item_id), record)
    }

    fn read_item(&self, stage: &str, item_id: &str) -> Result<Option<ItemRecord>, ItemflowError> {
        read_json_opt(&self.layout.item_path(stage, item_id))
    }

    fn write_stage(&self, output: &StageOutput) -> Result<(), ItemflowError> {
        write_json_atomic(&self.layout.stage_output_path(&output.stage), output)
    }

    fn read_stage(&self, stage: &str) -> Result<Option<StageOutput>, ItemflowError> {
        read_json_opt(&self.layout.stage_output_path(stage))
    }
}
