//! Client-side rate limiting for a backend.
//!
//! External request quotas are enforced here, at the adapter, rather than
//! by pausing the scheduler between batches.

use super::{BackendId, CompletionBackend, CompletionRequest, CompletionResponse};
use crate::errors::BackendError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Wraps a backend so call starts are spaced at least `min_interval` apart.
pub struct RateLimitedBackend {
    inner: Arc<dyn CompletionBackend>,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimitedBackend {
    /// Creates a limiter with a fixed spacing between calls.
    #[must_use]
    pub fn new(inner: Arc<dyn CompletionBackend>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Creates a limiter allowing `requests_per_minute` calls.
    #[must_use]
    pub fn per_minute(inner: Arc<dyn CompletionBackend>, requests_per_minute: u32) -> Self {
        let rpm = u64::from(requests_per_minute.max(1));
        Self::new(inner, Duration::from_millis(60_000 / rpm))
    }

    /// Returns the enforced spacing.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits for the next free slot and reserves it.
    async fn acquire(&self) {
        let wait_until = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        if wait_until > Instant::now() {
            let wait_ms = u64::try_from((wait_until - Instant::now()).as_millis()).unwrap_or(u64::MAX);
            trace!(wait_ms, "Rate limiter delaying call");
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

impl std::fmt::Debug for RateLimitedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedBackend")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CompletionBackend for RateLimitedBackend {
    async fn complete(
        &self,
        request: CompletionRequest,
        backend: &BackendId,
    ) -> Result<CompletionResponse, BackendError> {
        self.acquire().await;
        self.inner.complete(request, backend).await
    }
}
