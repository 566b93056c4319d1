//! Bounded sliding-window scheduler.
//!
//! [`BoundedScheduler::run`] keeps at most `concurrency` handlers in flight
//! and admits the next item as soon as any in-flight handler finishes. The
//! handlers are polled on the calling task through a `FuturesUnordered`, so
//! nothing is spawned and nothing needs to be `'static`.
//!
//! Completions are handed to an `on_complete` callback one at a time, in
//! completion order. A `flush` callback is debounced by [`FlushPolicy`] and
//! always invoked once more after the window has drained.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Default number of completions between flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Default maximum time a completion may wait for a flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// When the debounced flush hook fires.
///
/// A flush happens after `every_completions` unflushed completions or once
/// `interval` has elapsed since the oldest unflushed completion, whichever
/// comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Completion count threshold.
    pub every_completions: usize,
    /// Time threshold.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_completions: DEFAULT_FLUSH_EVERY,
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl FlushPolicy {
    /// Creates a flush policy.
    #[must_use]
    pub fn new(every_completions: usize, interval: Duration) -> Self {
        Self {
            every_completions: every_completions.max(1),
            interval,
        }
    }
}

/// Counters describing one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Items handed to the handler.
    pub dispatched: usize,
    /// Handlers that finished.
    pub completed: usize,
    /// Flush hook invocations, including the final one.
    pub flushes: usize,
    /// Highest number of handlers in flight at once.
    pub max_in_flight: usize,
}

/// Runs per-item handlers under a concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedScheduler {
    concurrency: usize,
    flush: FlushPolicy,
}

impl BoundedScheduler {
    /// Creates a scheduler; a ceiling of zero is treated as one.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            flush: FlushPolicy::default(),
        }
    }

    /// Sets the flush policy.
    #[must_use]
    pub fn with_flush_policy(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    /// The concurrency ceiling.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dispatches every item exactly once.
    ///
    /// `handler` must report per-item failures through its output `T`; an
    /// error returned by `on_complete` or `flush` stops the run and drops
    /// the remaining in-flight handlers.
    pub async fn run<I, T, E, H, Fut, C, F>(
        &self,
        items: I,
        mut handler: H,
        mut on_complete: C,
        mut flush: F,
    ) -> Result<SchedulerReport, E>
    where
        I: IntoIterator,
        H: FnMut(I::Item) -> Fut,
        Fut: Future<Output = T>,
        C: FnMut(T) -> Result<(), E>,
        F: FnMut() -> Result<(), E>,
    {
        let mut pending = items.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut report = SchedulerReport::default();

        for item in pending.by_ref().take(self.concurrency) {
            in_flight.push(handler(item));
            report.dispatched += 1;
        }
        report.max_in_flight = in_flight.len();

        let mut unflushed = 0usize;
        let mut dirty_since: Option<Instant> = None;

        while !in_flight.is_empty() {
            let deadline = dirty_since.map(|since| since + self.flush.interval);
            tokio::select! {
                biased;
                Some(output) = in_flight.next() => {
                    report.completed += 1;
                    if let Some(item) = pending.next() {
                        in_flight.push(handler(item));
                        report.dispatched += 1;
                        report.max_in_flight = report.max_in_flight.max(in_flight.len());
                    }
                    on_complete(output)?;
                    unflushed += 1;
                    dirty_since.get_or_insert_with(Instant::now);
                    if unflushed >= self.flush.every_completions {
                        trace!(unflushed, "Flushing on completion count");
                        flush()?;
                        report.flushes += 1;
                        unflushed = 0;
                        dirty_since = None;
                    }
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    trace!(unflushed, "Flushing on interval");
                    flush()?;
                    report.flushes += 1;
                    unflushed = 0;
                    dirty_since = None;
                }
            }
        }

        flush()?;
        report.flushes += 1;
        Ok(report)
    }
}
