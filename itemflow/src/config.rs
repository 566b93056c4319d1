//! Engine configuration.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file,
//! then `ITEMFLOW_*` environment variables. Per-stage overrides in the file
//! take precedence over what a stage declares in code.

use crate::errors::ItemflowError;
use crate::pipeline::RetryPolicy;
use crate::scheduler::{FlushPolicy, DEFAULT_FLUSH_EVERY, DEFAULT_FLUSH_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default concurrency ceiling per stage.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Overrides for a single stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOverrides {
    /// Concurrency ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Default concurrency ceiling.
    pub concurrency: usize,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Completions between state flushes.
    pub flush_every: usize,
    /// Maximum time between a completion and its flush.
    pub flush_interval_ms: u64,
    /// Directory holding run directories.
    pub output_root: PathBuf,
    /// Per-stage overrides keyed by stage name.
    pub stages: HashMap<String, StageOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            flush_every: DEFAULT_FLUSH_EVERY,
            flush_interval_ms: u64::try_from(DEFAULT_FLUSH_INTERVAL.as_millis()).unwrap_or(500),
            output_root: PathBuf::from("./runs"),
            stages: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file; missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ItemflowError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            ItemflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ItemflowError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// Applies `ITEMFLOW_*` variables from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self, ItemflowError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `ITEMFLOW_*` overrides from an arbitrary lookup.
    ///
    /// Recognized keys: `ITEMFLOW_CONCURRENCY`, `ITEMFLOW_MAX_ATTEMPTS`,
    /// `ITEMFLOW_RETRY_DELAY_MS`, `ITEMFLOW_CALL_TIMEOUT_MS` (0 disables
    /// the timeout) and `ITEMFLOW_OUTPUT_ROOT`.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, ItemflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "ITEMFLOW_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "ITEMFLOW_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "ITEMFLOW_RETRY_DELAY_MS")? {
            self.retry.retry_delay_ms = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ITEMFLOW_CALL_TIMEOUT_MS")? {
            self.retry.call_timeout_ms = (v > 0).then_some(v);
        }
        if let Some(v) = lookup("ITEMFLOW_OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        Ok(self)
    }

    /// Sets the default concurrency ceiling.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the flush thresholds.
    #[must_use]
    pub fn with_flush(mut self, every: usize, interval_ms: u64) -> Self {
        self.flush_every = every;
        self.flush_interval_ms = interval_ms;
        self
    }

    /// Sets the output root.
    #[must_use]
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Adds overrides for one stage.
    #[must_use]
    pub fn with_stage_overrides(mut self, stage: impl Into<String>, overrides: StageOverrides) -> Self {
        self.stages.insert(stage.into(), overrides);
        self
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ItemflowError> {
        if self.concurrency == 0 {
            return Err(ItemflowError::Config("concurrency must be at least 1".into()));
        }
        if self.flush_every == 0 {
            return Err(ItemflowError::Config("flushEvery must be at least 1".into()));
        }
        validate_retry("retry", &self.retry)?;
        for (stage, overrides) in &self.stages {
            if overrides.concurrency == Some(0) {
                return Err(ItemflowError::Config(format!(
                    "stage '{stage}': concurrency must be at least 1"
                )));
            }
            if let Some(retry) = &overrides.retry {
                validate_retry(&format!("stage '{stage}' retry"), retry)?;
            }
        }
        Ok(())
    }

    /// The flush policy.
    #[must_use]
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.flush_every, Duration::from_millis(self.flush_interval_ms))
    }

    /// Effective concurrency for a stage.
    ///
    /// Config overrides beat the stage's own declaration, which beats the
    /// global default.
    #[must_use]
    pub fn concurrency_for(&self, stage: &str, declared: Option<usize>) -> usize {
        self.stages
            .get(stage)
            .and_then(|o| o.concurrency)
            .or(declared)
            .unwrap_or(self.concurrency)
            .max(1)
    }

    /// Effective retry policy for a stage, with the same precedence.
    #[must_use]
    pub fn retry_for(&self, stage: &str, declared: Option<RetryPolicy>) -> RetryPolicy {
        self.stages
            .get(stage)
            .and_then(|o| o.retry.clone())
            .or(declared)
            .unwrap_or_else(|| self.retry.clone())
    }
}

fn validate_retry(label: &str, retry: &RetryPolicy) -> Result<(), ItemflowError> {
    if retry.max_attempts == 0 {
        return Err(ItemflowError::Config(format!(
            "{label}: maxAttempts must be at least 1"
        )));
    }
    if retry.call_timeout_ms == Some(0) {
        return Err(ItemflowError::Config(format!(
            "{label}: callTimeoutMs must be positive or null"
        )));
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ItemflowError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| ItemflowError::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}
