//! Dispatch of requests to backends by id.

use super::{BackendId, CompletionBackend, CompletionRequest, CompletionResponse};
use crate::errors::BackendError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes each request to the backend registered under its [`BackendId`].
///
/// Swapping the escalated model is a matter of registering a different
/// backend under the escalated id.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn CompletionBackend>>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under an id, replacing any previous one.
    #[must_use]
    pub fn with_backend(mut self, id: impl Into<BackendId>, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backends.insert(id.into(), backend);
        self
    }

    /// Returns the backend registered under `id`.
    #[must_use]
    pub fn get(&self, id: &BackendId) -> Option<&Arc<dyn CompletionBackend>> {
        self.backends.get(id)
    }

    /// Returns the registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<_> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[async_trait]
impl CompletionBackend for BackendRegistry {
    async fn complete(
        &self,
        request: CompletionRequest,
        backend: &BackendId,
    ) -> Result<CompletionResponse, BackendError> {
        let target = self
            .get(backend)
            .ok_or_else(|| BackendError::UnknownBackend(backend.to_string()))?;
        target.complete(request, backend).await
    }
}
