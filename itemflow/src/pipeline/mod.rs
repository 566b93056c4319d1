//! Pipeline building and execution.
//!
//! This module provides:
//! - The per-item retry and escalation controller
//! - The stage runner driving one stage through the scheduler
//! - The pipeline builder and sequential orchestrator
//! - Run and stage summaries

mod builder;
mod orchestrator;
mod report;
mod retry;
mod runner;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use orchestrator::{Pipeline, RunSession};
pub use report::{RunReport, StageSummary};
pub use retry::{
    ItemOutcome, Preprocessed, RetryController, RetryPolicy, TransformOutput,
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_RETRY_DELAY_MS, MAX_RETRIES,
};
pub use runner::{RunContext, StageRun, StageRunner};
