//! Tracing setup and span helpers.
//!
//! The engine logs through `tracing`; binaries and tests choose how those
//! events are rendered by calling [`init_tracing`] once at startup.

use tokio::time::Instant;
use tracing::{info_span, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::ItemflowError;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "itemflow=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over [`DEFAULT_FILTER`]. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), ItemflowError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(false).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    result.map_err(|e| ItemflowError::Config(format!("tracing already initialized: {e}")))
}

/// Span covering one pipeline run.
#[must_use]
pub fn run_span(pipeline: &str, run_id: &str) -> Span {
    info_span!("pipeline_run", pipeline = %pipeline, run_id = %run_id)
}

/// Span covering one stage.
#[must_use]
pub fn stage_span(stage: &str) -> Span {
    info_span!("stage", stage = %stage)
}

/// Measures elapsed wall time.
#[derive(Debug, Clone, Copy)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        crate::utils::duration_ms(self.start.elapsed())
    }
}
