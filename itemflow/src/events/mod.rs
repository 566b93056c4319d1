//! Run lifecycle events.
//!
//! The engine reports progress through an [`EventSink`]. Stage and run
//! boundaries are emitted with [`EventSink::emit`]; item-level events fire
//! from synchronous completion callbacks and use [`EventSink::try_emit`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the engine.
pub mod event_types {
    /// A fresh run started.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A persisted run was reopened.
    pub const PIPELINE_RESUMED: &str = "pipeline.resumed";
    /// Every stage finished.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage began dispatching items.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage was already complete and was short-circuited.
    pub const STAGE_RESUMED: &str = "stage.resumed";
    /// Every item of a stage is terminal.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// An attempt failed and another will follow.
    pub const ITEM_RETRY: &str = "item.retry";
    /// An item was transformed.
    pub const ITEM_COMPLETED: &str = "item.completed";
    /// An item was resolved without a transform.
    pub const ITEM_SKIPPED: &str = "item.skipped";
    /// An item exhausted its attempts.
    pub const ITEM_FAILED: &str = "item.failed";
}
