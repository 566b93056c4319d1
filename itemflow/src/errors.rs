//! Error types for the itemflow engine.
//!
//! Errors are split by blast radius: [`BackendError`] is contained at the
//! item level and drives retries, [`StateError`] guards the item state
//! machine, and [`ItemflowError`] is what halts a pipeline run.

use thiserror::Error;

use crate::core::ItemStatus;

/// The main error type for itemflow operations.
///
/// Only these errors abort a run. Per-item backend failures are recorded in
/// item state and never surface here.
#[derive(Debug, Error)]
pub enum ItemflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage's item loader failed; the run cannot make progress.
    #[error("Stage '{stage}' failed to load items: {source}")]
    Loader {
        /// The stage whose loader failed.
        stage: String,
        /// The loader error.
        #[source]
        source: anyhow::Error,
    },

    /// A loader produced the same item id twice.
    #[error("Stage '{stage}' produced duplicate item id '{item_id}'")]
    DuplicateItem {
        /// The stage name.
        stage: String,
        /// The duplicated id.
        item_id: String,
    },

    /// A declared dependency source could not be located or read.
    #[error("Dependency '{dependency}' of stage '{stage}' is unavailable: {reason}")]
    DependencyUnavailable {
        /// The consuming stage.
        stage: String,
        /// The upstream stage named by the declaration.
        dependency: String,
        /// Why the source is unavailable.
        reason: String,
    },

    /// An item state transition was rejected.
    #[error("{0}")]
    State(#[from] StateError),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ItemflowError {
    /// Creates a loader error for a stage.
    pub fn loader(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Loader {
            stage: stage.into(),
            source,
        }
    }

    /// Creates a dependency-unavailable error.
    pub fn dependency_unavailable(
        stage: impl Into<String>,
        dependency: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyUnavailable {
            stage: stage.into(),
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single call to a completion backend.
///
/// The variants are kept distinct so the retry controller can apply a
/// different policy per condition; today every retryable kind is retried
/// the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The call did not finish within the attempt timeout.
    #[error("Backend call timed out after {after_ms}ms")]
    Timeout {
        /// Elapsed time before the call was abandoned.
        after_ms: u64,
    },

    /// The backend rejected the call because of rate limiting.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Message from the backend.
        message: String,
        /// Suggested wait before retrying, if the backend provided one.
        retry_after_ms: Option<u64>,
    },

    /// The backend answered but the output did not match the expected shape.
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// Any other request failure (transport, server error).
    #[error("Request failed: {0}")]
    Request(String),

    /// No backend is registered under the requested id.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
}

impl BackendError {
    /// Creates a rate limit error without a retry hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Creates a malformed output error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput(message.into())
    }

    /// Creates a generic request error.
    #[must_use]
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request(message.into())
    }

    /// Stable label recorded in item state and events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedOutput(_) => "malformed_output",
            Self::Request(_) => "request",
            Self::UnknownBackend(_) => "unknown_backend",
        }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownBackend(_))
    }
}

/// Errors raised by the item state store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The requested status change is not allowed.
    #[error("Invalid transition for item '{item_id}' in stage '{stage}': {from} -> {to}")]
    InvalidTransition {
        /// Stage name.
        stage: String,
        /// Item id.
        item_id: String,
        /// Current status.
        from: ItemStatus,
        /// Requested status.
        to: ItemStatus,
    },

    /// A terminal item was updated.
    #[error("Item '{item_id}' in stage '{stage}' is already {status} and cannot be modified")]
    Terminal {
        /// Stage name.
        stage: String,
        /// Item id.
        item_id: String,
        /// Terminal status.
        status: ItemStatus,
    },

    /// The stage is not part of this run.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// A persisted state file belongs to a different pipeline.
    #[error("State file belongs to pipeline '{found}', expected '{expected}'")]
    PipelineMismatch {
        /// Pipeline being run.
        expected: String,
        /// Pipeline recorded in the file.
        found: String,
    },
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}
