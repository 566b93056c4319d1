//! Scripted stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendId;
use crate::core::{TokenUsage, WorkItem};
use crate::dependencies::{DependencyDeclaration, ResolvedDependencies};
use crate::errors::BackendError;
use crate::pipeline::{Preprocessed, RetryPolicy, TransformOutput};
use crate::stages::{LoadContext, Stage};

/// Tracks how many calls are in flight and the highest count seen.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a call as in flight until the guard is dropped.
    #[must_use]
    pub fn enter(&self) -> ProbeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls in flight at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the probe when dropped.
#[derive(Debug)]
pub struct ProbeGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A stage whose items and transform behavior are scripted per item.
///
/// Items default to ids `"1"..="n"` with payload `{"id": "<i>", "n": <i>}`.
/// The transform echoes its input; scripted failures are reported as
/// malformed output so they are retried.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    items: Vec<WorkItem>,
    loader_error: Option<String>,
    dependencies: Vec<DependencyDeclaration>,
    concurrency: Option<usize>,
    retry: Option<RetryPolicy>,
    failures: HashMap<String, u32>,
    latencies: HashMap<String, Duration>,
    default_latency: Duration,
    hanging: HashSet<String>,
    fast_path: HashSet<String>,
    usage: TokenUsage,
    calls: Mutex<Vec<(String, BackendId)>>,
    loads: AtomicUsize,
    probe: ConcurrencyProbe,
}

impl ScriptedStage {
    /// Creates a stage with `n` items.
    #[must_use]
    pub fn new(name: impl Into<String>, n: usize) -> Self {
        let items = (1..=n)
            .map(|i| WorkItem::new(i.to_string(), json!({"id": i.to_string(), "n": i})))
            .collect();
        Self {
            name: name.into(),
            items,
            loader_error: None,
            dependencies: Vec::new(),
            concurrency: None,
            retry: None,
            failures: HashMap::new(),
            latencies: HashMap::new(),
            default_latency: Duration::ZERO,
            hanging: HashSet::new(),
            fast_path: HashSet::new(),
            usage: TokenUsage::new(10, 5),
            calls: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            probe: ConcurrencyProbe::new(),
        }
    }

    /// Replaces the items.
    #[must_use]
    pub fn with_items(mut self, items: Vec<WorkItem>) -> Self {
        self.items = items;
        self
    }

    /// Makes the loader fail.
    #[must_use]
    pub fn with_loader_error(mut self, message: impl Into<String>) -> Self {
        self.loader_error = Some(message.into());
        self
    }

    /// Adds a dependency declaration.
    #[must_use]
    pub fn with_dependency(mut self, dependency: DependencyDeclaration) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Declares a concurrency ceiling.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Declares a retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Fails the first `times` attempts of an item.
    #[must_use]
    pub fn failing(mut self, item_id: impl Into<String>, times: u32) -> Self {
        self.failures.insert(item_id.into(), times);
        self
    }

    /// Fails every attempt of an item.
    #[must_use]
    pub fn always_failing(self, item_id: impl Into<String>) -> Self {
        self.failing(item_id, u32::MAX)
    }

    /// Sets the transform latency of one item.
    #[must_use]
    pub fn with_latency(mut self, item_id: impl Into<String>, latency: Duration) -> Self {
        self.latencies.insert(item_id.into(), latency);
        self
    }

    /// Sets the transform latency of items without their own.
    #[must_use]
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Makes an item's transform never return.
    #[must_use]
    pub fn hanging(mut self, item_id: impl Into<String>) -> Self {
        self.hanging.insert(item_id.into());
        self
    }

    /// Resolves an item on the fast path.
    #[must_use]
    pub fn fast_path(mut self, item_id: impl Into<String>) -> Self {
        self.fast_path.insert(item_id.into());
        self
    }

    /// Every transform call in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, BackendId)> {
        self.calls.lock().clone()
    }

    /// Backends used for one item, in attempt order.
    #[must_use]
    pub fn calls_for(&self, item_id: &str) -> Vec<BackendId> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == item_id)
            .map(|(_, backend)| backend.clone())
            .collect()
    }

    /// Number of transform calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of loader invocations.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Probe around transform calls.
    #[must_use]
    pub fn probe(&self) -> &ConcurrencyProbe {
        &self.probe
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<DependencyDeclaration> {
        self.dependencies.clone()
    }

    fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry.clone()
    }

    async fn load_items(&self, _ctx: &LoadContext<'_>) -> anyhow::Result<Vec<WorkItem>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.loader_error {
            anyhow::bail!("{message}");
        }
        Ok(self.items.clone())
    }

    async fn preprocess(&self, item: &WorkItem, deps: &ResolvedDependencies) -> Preprocessed {
        if self.fast_path.contains(&item.id) {
            return Preprocessed::skip(
                "single candidate",
                json!({"id": item.id, "input": item.payload, "fast": true}),
            );
        }
        Preprocessed::proceed(json!({
            "id": item.id,
            "input": item.payload,
            "deps": deps.to_value(),
        }))
    }

    async fn transform(
        &self,
        input: Value,
        backend: &BackendId,
    ) -> Result<TransformOutput, BackendError> {
        let id = input
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push((id.clone(), backend.clone()));
            calls.iter().filter(|(seen, _)| *seen == id).count()
        };
        let _guard = self.probe.enter();

        let latency = self.latencies.get(&id).copied().unwrap_or(self.default_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.hanging.contains(&id) {
            std::future::pending::<()>().await;
        }

        let failures = self.failures.get(&id).copied().unwrap_or(0);
        if u32::try_from(attempt).unwrap_or(u32::MAX) <= failures {
            return Err(BackendError::malformed(format!(
                "scripted failure {attempt} of item {id}"
            )));
        }
        Ok(TransformOutput::new(json!({
            "id": id,
            "input": input.get("input").cloned().unwrap_or(Value::Null),
            "deps": input.get("deps").cloned().unwrap_or(Value::Null),
        }))
        .with_usage(self.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();
        let a = probe.enter();
        let b = probe.enter();
        drop(a);
        let _c = probe.enter();
        drop(b);

        assert_eq!(probe.peak(), 2);
        assert_eq!(probe.active(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let stage = ScriptedStage::new("s", 1).failing("1", 1);
        let input = json!({"id": "1", "input": {}});

        assert!(stage.transform(input.clone(), &BackendId::default_backend()).await.is_err());
        assert!(stage.transform(input, &BackendId::escalated()).await.is_ok());
        assert_eq!(
            stage.calls_for("1"),
            vec![BackendId::default_backend(), BackendId::escalated()]
        );
    }
}
