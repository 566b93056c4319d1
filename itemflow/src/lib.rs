//! # Itemflow
//!
//! A resumable, multi-stage item pipeline engine for slow, rate-limited
//! completion backends.
//!
//! Itemflow runs large batches of independent work items through an ordered
//! list of stages, with support for:
//!
//! - **Bounded concurrency**: a sliding window keeps a fixed number of backend
//!   calls in flight and starts the next item as soon as one finishes
//! - **Retry with escalation**: failed calls are retried after a fixed delay,
//!   and the final attempt goes to a stronger backend
//! - **Fast path**: items that need no backend call are resolved during
//!   preprocessing
//! - **Durable, resumable state**: every item's status is persisted
//!   atomically; a resumed run never re-attempts completed, skipped or failed
//!   items
//! - **Composite-key dependencies**: stages join their items against records
//!   of earlier stages in the same run or in a prior run
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use itemflow::prelude::*;
//!
//! let pipeline = Pipeline::builder("provisions")
//!     .stage(Arc::new(ExtractStage::new()))?
//!     .stage(Arc::new(EnrichStage::new()))?
//!     .with_config(EngineConfig::default().with_concurrency(20))
//!     .build()?;
//!
//! let session = pipeline.new_session()?;
//! let report = pipeline.run(&session).await?;
//!
//! // After an interruption:
//! let session = RunSession::resume(&pipeline, "./runs", &report.run_id)?;
//! pipeline.run(&session).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod config;
pub mod core;
pub mod dependencies;
pub mod errors;
pub mod events;
pub mod observability;
pub mod output;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod state;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendId, BackendRegistry, CompletionBackend};
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        ItemStatus, OutputRecord, RunStatus, StageOutput, StageStatus, TokenUsage, WorkItem,
    };
    pub use crate::dependencies::{DependencyDeclaration, ResolvedDependencies, RunSelector};
    pub use crate::errors::{BackendError, ItemflowError, PipelineValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        Pipeline, PipelineBuilder, Preprocessed, RetryPolicy, RunReport, RunSession,
        TransformOutput,
    };
    pub use crate::stages::{LoadContext, Stage};
    pub use std::sync::Arc;
}
