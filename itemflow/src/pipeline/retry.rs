//! Per-item retry and escalation.
//!
//! Every item gets up to [`RetryPolicy::max_attempts`] calls to its stage's
//! transform. All but the last attempt use the default backend; the last
//! one switches to the escalated backend. Attempts are separated by a fixed
//! delay and each call is bounded by the attempt timeout.

use crate::backend::BackendId;
use crate::core::{ItemStatus, TokenUsage};
use crate::errors::{BackendError, StateError};
use crate::events::{event_types, EventSink};
use crate::state::{ItemUpdate, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts per item.
pub const MAX_RETRIES: u32 = 3;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default bound on a single backend call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 120_000;

/// Retry and escalation parameters for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts per item, including the escalated one.
    pub max_attempts: u32,
    /// Fixed delay after a failed attempt.
    pub retry_delay_ms: u64,
    /// Per-call timeout; `None` disables it.
    pub call_timeout_ms: Option<u64>,
    /// Backend for every attempt except the last.
    pub default_backend: BackendId,
    /// Backend for the last attempt.
    pub escalated_backend: BackendId,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            call_timeout_ms: Some(DEFAULT_CALL_TIMEOUT_MS),
            default_backend: BackendId::default_backend(),
            escalated_backend: BackendId::escalated(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt count; zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    /// Sets or clears the per-call timeout.
    #[must_use]
    pub fn with_call_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.call_timeout_ms = timeout;
        self
    }

    /// Sets both backend identifiers.
    #[must_use]
    pub fn with_backends(
        mut self,
        default_backend: impl Into<BackendId>,
        escalated_backend: impl Into<BackendId>,
    ) -> Self {
        self.default_backend = default_backend.into();
        self.escalated_backend = escalated_backend.into();
        self
    }

    /// Backend for a 1-based attempt number.
    ///
    /// A single-attempt policy never escalates.
    #[must_use]
    pub fn backend_for_attempt(&self, attempt: u32) -> &BackendId {
        if self.max_attempts > 1 && attempt >= self.max_attempts {
            &self.escalated_backend
        } else {
            &self.default_backend
        }
    }

    /// Delay between attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Per-call timeout, if any.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Result of a stage's preprocessing step.
#[derive(Debug, Clone, PartialEq)]
pub enum Preprocessed {
    /// The result is already known; no backend call is made.
    Skip {
        /// Human-readable reason.
        reason: String,
        /// The predetermined result.
        result: Value,
    },
    /// Call the transform with this input.
    Proceed {
        /// Transform input.
        input: Value,
    },
}

impl Preprocessed {
    /// Creates a fast-path skip.
    #[must_use]
    pub fn skip(reason: impl Into<String>, result: Value) -> Self {
        Self::Skip {
            reason: reason.into(),
            result,
        }
    }

    /// Creates a proceed result.
    #[must_use]
    pub fn proceed(input: Value) -> Self {
        Self::Proceed { input }
    }
}

/// Successful output of one transform call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    /// The transform result.
    pub value: Value,
    /// Usage reported by the backend.
    pub usage: TokenUsage,
}

impl TransformOutput {
    /// Creates an output with no usage.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            usage: TokenUsage::default(),
        }
    }

    /// Sets the usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The transform succeeded.
    Completed {
        /// Transform result.
        result: Value,
        /// Attempt that succeeded.
        attempts: u32,
        /// Backend of the successful attempt.
        backend: BackendId,
        /// Usage of the successful call.
        usage: TokenUsage,
    },
    /// The item was resolved without a successful transform.
    Skipped {
        /// Why it was skipped.
        reason: String,
        /// Result to materialize, if any.
        result: Option<Value>,
        /// True for preprocessing fast paths.
        fast_path: bool,
    },
    /// Every attempt failed.
    Failed {
        /// Last error message.
        error: String,
        /// Last error kind.
        kind: String,
        /// Attempts made.
        attempts: u32,
        /// Backend of the last attempt.
        backend: BackendId,
    },
}

impl ItemOutcome {
    /// Terminal status for this outcome.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        match self {
            Self::Completed { .. } => ItemStatus::Completed,
            Self::Skipped { .. } => ItemStatus::Skipped,
            Self::Failed { .. } => ItemStatus::Failed,
        }
    }

    /// The result payload, if one exists.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Completed { result, .. } => Some(result),
            Self::Skipped { result, .. } => result.as_ref(),
            Self::Failed { .. } => None,
        }
    }
}

/// Drives the attempts of one item against a transform.
#[derive(Clone, Copy)]
pub struct RetryController<'a> {
    policy: &'a RetryPolicy,
    store: &'a StateStore,
    events: &'a dyn EventSink,
}

impl std::fmt::Debug for RetryController<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", self.policy)
            .finish_non_exhaustive()
    }
}

impl<'a> RetryController<'a> {
    /// Creates a controller that records attempts in `store`.
    #[must_use]
    pub fn new(policy: &'a RetryPolicy, store: &'a StateStore, events: &'a dyn EventSink) -> Self {
        Self {
            policy,
            store,
            events,
        }
    }

    /// The policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        self.policy
    }

    /// Runs a preprocessed item to a terminal outcome.
    ///
    /// The item must already be `running`. A fast-path skip returns
    /// immediately with zero attempts. Otherwise each attempt bumps the
    /// recorded attempt count and backend before calling `transform`.
    /// Only state store errors are returned as `Err`.
    pub async fn execute<F, Fut>(
        &self,
        stage: &str,
        item_id: &str,
        prepared: Preprocessed,
        mut transform: F,
    ) -> Result<ItemOutcome, StateError>
    where
        F: FnMut(Value, BackendId) -> Fut,
        Fut: Future<Output = Result<TransformOutput, BackendError>>,
    {
        let input = match prepared {
            Preprocessed::Skip { reason, result } => {
                debug!(stage, item_id, %reason, "Fast path");
                return Ok(ItemOutcome::Skipped {
                    reason,
                    result: Some(result),
                    fast_path: true,
                });
            }
            Preprocessed::Proceed { input } => input,
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = BackendError::request("no attempt made");
        let mut last_backend = self.policy.default_backend.clone();
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            let backend = self.policy.backend_for_attempt(attempt).clone();
            self.store.upsert(
                stage,
                item_id,
                ItemUpdate::status(ItemStatus::Running)
                    .with_attempts(attempt)
                    .with_backend(backend.clone()),
            )?;
            attempts = attempt;
            last_backend = backend.clone();

            let call = transform(input.clone(), backend.clone());
            let result = match self.policy.call_timeout() {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(BackendError::Timeout {
                        after_ms: self.policy.call_timeout_ms.unwrap_or_default(),
                    })
                }),
                None => call.await,
            };

            match result {
                Ok(output) => {
                    return Ok(ItemOutcome::Completed {
                        result: output.value,
                        attempts: attempt,
                        backend,
                        usage: output.usage,
                    });
                }
                Err(err) => {
                    let retry = err.is_retryable() && attempt < max_attempts;
                    warn!(
                        stage,
                        item_id,
                        attempt,
                        backend = %backend,
                        kind = err.kind(),
                        error = %err,
                        retry,
                        "Attempt failed"
                    );
                    last_error = err;
                    if !retry {
                        break;
                    }
                    self.events.try_emit(
                        event_types::ITEM_RETRY,
                        Some(json!({
                            "stage": stage,
                            "item_id": item_id,
                            "attempt": attempt,
                            "backend": backend.as_str(),
                            "next_backend": self.policy.backend_for_attempt(attempt + 1).as_str(),
                            "error_kind": last_error.kind(),
                            "error": last_error.to_string(),
                        })),
                    );
                    tokio::time::sleep(self.policy.retry_delay()).await;
                }
            }
        }

        Ok(ItemOutcome::Failed {
            error: last_error.to_string(),
            kind: last_error.kind().to_string(),
            attempts,
            backend: last_backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::state::PipelineState;
    use serde_json::json;
    use std::cell::RefCell;

    fn running_store() -> StateStore {
        let store = StateStore::in_memory(PipelineState::new("run", "p", vec!["s".into()]));
        store.begin_stage("s", &["1".to_string()]).unwrap();
        store
            .upsert("s", "1", ItemUpdate::status(ItemStatus::Running))
            .unwrap();
        store
    }

    #[test]
    fn test_backend_for_attempt_escalates_last() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backend_for_attempt(1).as_str(), "default");
        assert_eq!(policy.backend_for_attempt(2).as_str(), "default");
        assert_eq!(policy.backend_for_attempt(3).as_str(), "escalated");
    }

    #[test]
    fn test_single_attempt_never_escalates() {
        let policy = RetryPolicy::new().with_max_attempts(1);
        assert_eq!(policy.backend_for_attempt(1).as_str(), "default");
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({"maxAttempts": 5})).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(policy.escalated_backend.as_str(), "escalated");
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_escalated_attempt() {
        let store = running_store();
        let policy = RetryPolicy::default();
        let events = CollectingEventSink::new();
        let calls = RefCell::new(Vec::new());
        let controller = RetryController::new(&policy, &store, &events);

        let outcome = controller
            .execute("s", "1", Preprocessed::proceed(json!({"n": 1})), |input, backend| {
                calls.borrow_mut().push(backend.clone());
                async move {
                    if backend.as_str() == "escalated" {
                        Ok(TransformOutput::new(input).with_usage(TokenUsage::new(3, 4)))
                    } else {
                        Err(BackendError::malformed("missing field"))
                    }
                }
            })
            .await
            .unwrap();

        let ItemOutcome::Completed { attempts, backend, usage, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(attempts, 3);
        assert_eq!(backend.as_str(), "escalated");
        assert_eq!(usage.total_tokens(), 7);
        let calls: Vec<String> = calls.into_inner().iter().map(ToString::to_string).collect();
        assert_eq!(calls, vec!["default", "default", "escalated"]);
        assert_eq!(events.count(event_types::ITEM_RETRY), 2);

        let state = store.get("s", "1").unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.status, ItemStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let store = running_store();
        let policy = RetryPolicy::default();
        let controller = RetryController::new(&policy, &store, &NoOpEventSink);
        let start = tokio::time::Instant::now();

        let outcome = controller
            .execute("s", "1", Preprocessed::proceed(json!(null)), |_, _| async {
                Err::<TransformOutput, _>(BackendError::rate_limited("429"))
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ItemOutcome::Failed {
                error: "Rate limited: 429".into(),
                kind: "rate_limited".into(),
                attempts: 3,
                backend: BackendId::escalated(),
            }
        );
        // Two fixed delays, no backoff.
        assert!(start.elapsed() >= Duration::from_millis(2 * DEFAULT_RETRY_DELAY_MS));
        assert!(start.elapsed() < Duration::from_millis(3 * DEFAULT_RETRY_DELAY_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let store = running_store();
        let policy = RetryPolicy::new()
            .with_max_attempts(2)
            .with_retry_delay_ms(0)
            .with_call_timeout_ms(Some(50));
        let controller = RetryController::new(&policy, &store, &NoOpEventSink);

        let outcome = controller
            .execute("s", "1", Preprocessed::proceed(json!(1)), |input, backend| async move {
                if backend.as_str() == "default" {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(TransformOutput::new(input))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ItemOutcome::Completed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_not_retried() {
        let store = running_store();
        let policy = RetryPolicy::default();
        let controller = RetryController::new(&policy, &store, &NoOpEventSink);

        let outcome = controller
            .execute("s", "1", Preprocessed::proceed(json!(1)), |_, backend| async move {
                Err::<TransformOutput, _>(BackendError::UnknownBackend(backend.to_string()))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ItemOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_fast_path_makes_no_calls() {
        let store = running_store();
        let policy = RetryPolicy::default();
        let controller = RetryController::new(&policy, &store, &NoOpEventSink);
        let mut calls = 0;

        let outcome = controller
            .execute(
                "s",
                "1",
                Preprocessed::skip("single candidate", json!({"match": "A"})),
                |input, _| {
                    calls += 1;
                    async move { Ok(TransformOutput::new(input)) }
                },
            )
            .await
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(outcome.status(), ItemStatus::Skipped);
        assert_eq!(outcome.result(), Some(&json!({"match": "A"})));
        assert_eq!(store.get("s", "1").unwrap().attempts, 0);
    }
}
