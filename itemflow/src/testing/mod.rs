//! Testing utilities for itemflow pipelines.
//!
//! This module provides:
//! - A scripted stage with per-item failures, latencies and hangs
//! - A concurrency probe recording the in-flight high-water mark
//! - Assertions over run reports and item state

mod assertions;
mod mocks;

pub use assertions::{assert_item, assert_stage_counts};
pub use mocks::{ConcurrencyProbe, ProbeGuard, ScriptedStage};
