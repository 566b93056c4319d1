//! Core domain model types for itemflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Item, stage and run status enums
//! - Work items and their derived identifiers
//! - Token usage accounting
//! - Per-item records and materialized stage outputs

mod item;
mod output;
mod status;
mod usage;

pub use item::WorkItem;
pub use output::{ItemRecord, OutputRecord, StageOutput};
pub use status::{ItemStatus, RunStatus, StageStatus};
pub use usage::TokenUsage;
