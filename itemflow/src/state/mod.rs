//! Durable pipeline, stage and item state.
//!
//! [`PipelineState`] is the single JSON document that makes a run
//! resumable. [`StateStore`] owns it, serializes concurrent updates behind a
//! lock and writes it atomically.

mod atomic;
mod store;
mod types;

pub use atomic::write_json_atomic;
pub use store::{ItemUpdate, StateStore};
pub use types::{ItemState, PipelineState, StageState};
