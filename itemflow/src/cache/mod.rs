//! Single-flight lazy values.
//!
//! Stages that need an expensive shared resource (a reference table, a
//! prompt template, a lookup index over a prior run) load it through a
//! [`LazyCache`]. Concurrent first callers wait on one initialization
//! instead of each racing to load it.

use std::future::Future;
use tokio::sync::OnceCell;

/// A value computed at most once, on first use.
#[derive(Debug)]
pub struct LazyCache<T> {
    cell: OnceCell<T>,
}

impl<T> Default for LazyCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyCache<T> {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Returns the value, running `init` if no caller has initialized it yet.
    ///
    /// If `init` fails the cache stays empty and a later call retries.
    pub async fn get_or_try_init<E, F, Fut>(&self, init: F) -> Result<&T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cell.get_or_try_init(init).await
    }

    /// Returns the value, running `init` if needed.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> &T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.cell.get_or_init(init).await
    }

    /// Returns the value if it has been initialized.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// True once a value is stored.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}
