//! Completion backend adapter seam.
//!
//! The engine never talks to a model service directly. Stages call a
//! [`CompletionBackend`] with a [`BackendId`] chosen by the retry controller;
//! the id selects between the default and escalated configurations.

mod rate_limit;
mod registry;
mod request;

pub use rate_limit::RateLimitedBackend;
pub use registry::BackendRegistry;
pub use request::{CompletionRequest, CompletionResponse, Message, Role};

use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier selecting which backend configuration handles a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    /// Creates a backend id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id used for ordinary attempts.
    #[must_use]
    pub fn default_backend() -> Self {
        Self::new("default")
    }

    /// The id used for the final, escalated attempt.
    #[must_use]
    pub fn escalated() -> Self {
        Self::new("escalated")
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::default_backend()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A remote completion service.
///
/// Implementations must report timeouts, rate limits and malformed output as
/// distinct [`BackendError`] variants.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Sends one request to the backend selected by `backend`.
    async fn complete(
        &self,
        request: CompletionRequest,
        backend: &BackendId,
    ) -> Result<CompletionResponse, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_defaults() {
        assert_eq!(BackendId::default().as_str(), "default");
        assert_eq!(BackendId::escalated().to_string(), "escalated");
    }

    #[test]
    fn test_backend_id_serializes_transparently() {
        let json = serde_json::to_string(&BackendId::new("gpt-large")).unwrap();
        assert_eq!(json, r#""gpt-large""#);
    }

    #[tokio::test]
    async fn test_mock_backend_receives_backend_id() {
        let mut mock = MockCompletionBackend::new();
        mock.expect_complete()
            .withf(|_, backend| backend.as_str() == "escalated")
            .times(1)
            .returning(|_, _| Ok(CompletionResponse::new(serde_json::json!({"ok": true}))));

        let response = mock
            .complete(CompletionRequest::new(), &BackendId::escalated())
            .await
            .unwrap();
        assert_eq!(response.content["ok"], true);
    }
}
