//! Execution of a single stage.

use super::report::StageSummary;
use super::retry::{ItemOutcome, RetryController, RetryPolicy};
use crate::core::{ItemRecord, ItemStatus, StageOutput, StageStatus, WorkItem};
use crate::dependencies::{DependencyResolver, PriorRunSource};
use crate::errors::ItemflowError;
use crate::events::{event_types, EventSink};
use crate::observability::SpanTimer;
use crate::output::OutputStore;
use crate::scheduler::{BoundedScheduler, FlushPolicy};
use crate::stages::{LoadContext, Stage};
use crate::state::{ItemUpdate, StateStore};
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Shared resources of the run a stage executes in.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    /// Run id.
    pub run_id: &'a str,
    /// Item state store.
    pub store: &'a StateStore,
    /// Per-item and per-stage outputs.
    pub outputs: &'a dyn OutputStore,
    /// Event sink.
    pub events: &'a dyn EventSink,
    /// Outputs of stages that already ran in this run.
    pub materialized: &'a HashMap<String, Arc<StageOutput>>,
    /// Reader for other runs' outputs.
    pub prior_runs: Option<&'a dyn PriorRunSource>,
}

impl std::fmt::Debug for RunContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("materialized", &self.materialized.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Result of running one stage.
#[derive(Debug, Clone)]
pub struct StageRun {
    /// The materialized output.
    pub output: Arc<StageOutput>,
    /// Counts for the report.
    pub summary: StageSummary,
}

/// Runs one stage's items to terminal states.
#[derive(Debug)]
pub struct StageRunner<'s> {
    stage: &'s dyn Stage,
    policy: RetryPolicy,
    scheduler: BoundedScheduler,
}

impl<'s> StageRunner<'s> {
    /// Creates a runner.
    #[must_use]
    pub fn new(stage: &'s dyn Stage, policy: RetryPolicy, concurrency: usize, flush: FlushPolicy) -> Self {
        Self {
            stage,
            policy,
            scheduler: BoundedScheduler::new(concurrency).with_flush_policy(flush),
        }
    }

    /// Runs the stage, or returns its recorded output if it already completed.
    ///
    /// Only loader failures, unavailable dependency sources and state
    /// persistence failures are returned as errors; item failures are
    /// recorded and counted.
    pub async fn run(&self, ctx: RunContext<'_>) -> Result<StageRun, ItemflowError> {
        let name = self.stage.name();
        if ctx.store.stage_status(name) == Some(StageStatus::Completed) {
            return self.short_circuit(ctx);
        }

        let timer = SpanTimer::start();
        let load_ctx = LoadContext {
            run_id: ctx.run_id,
            stage: name,
            upstream: ctx.materialized,
        };
        let items = self
            .stage
            .load_items(&load_ctx)
            .await
            .map_err(|e| ItemflowError::loader(name, e))?;

        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item.id.as_str()) {
                return Err(ItemflowError::DuplicateItem {
                    stage: name.to_string(),
                    item_id: item.id.clone(),
                });
            }
        }

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        ctx.store.begin_stage(name, &ids)?;
        ctx.store.persist()?;

        let resolver = DependencyResolver::build(
            name,
            &self.stage.dependencies(),
            ctx.materialized,
            ctx.prior_runs,
        )?;

        let mut finished: HashMap<String, ItemRecord> = HashMap::new();
        let recovered = self.recover_recorded(ctx, &items, &mut finished)?;
        if recovered > 0 {
            info!(stage = name, recovered, "Recovered items finished after the last state flush");
            ctx.store.persist()?;
        }

        let pending: Vec<&WorkItem> = items
            .iter()
            .filter(|item| !ctx.store.get(name, &item.id).is_some_and(|s| s.is_terminal()))
            .collect();
        info!(
            stage = name,
            total = items.len(),
            pending = pending.len(),
            concurrency = self.scheduler.concurrency(),
            "Stage started"
        );
        ctx.events
            .emit(
                event_types::STAGE_STARTED,
                Some(json!({
                    "stage": name,
                    "run_id": ctx.run_id,
                    "total_items": items.len(),
                    "pending_items": pending.len(),
                })),
            )
            .await;

        let controller = RetryController::new(&self.policy, ctx.store, ctx.events);
        let resolver = &resolver;
        let controller = &controller;
        finished.reserve(pending.len());

        let report = self
            .scheduler
            .run(
                pending,
                move |item| self.process_item(ctx, resolver, controller, item),
                |record: Result<ItemRecord, ItemflowError>| {
                    let record = record?;
                    self.record_item(ctx, &record)?;
                    finished.insert(record.item_id.clone(), record);
                    Ok(())
                },
                || ctx.store.persist(),
            )
            .await?;
        debug!(stage = name, ?report, "Scheduler drained");

        let state = ctx.store.complete_stage(name)?;
        ctx.store.persist()?;

        let mut output = StageOutput::new(name, ctx.run_id);
        for item in &items {
            let record = match finished.remove(&item.id) {
                Some(record) => Some(record),
                None => self.read_previous(ctx, &item.id),
            };
            if let Some(out) = record.as_ref().and_then(ItemRecord::to_output) {
                output.records.push(out);
            }
        }
        ctx.outputs.write_stage(&output)?;

        let summary = StageSummary::from_state(name, &state, output.len(), false);
        info!(stage = name, duration_ms = timer.elapsed_ms(), "{summary}");
        ctx.events
            .emit(
                event_types::STAGE_COMPLETED,
                Some(json!({
                    "stage": name,
                    "run_id": ctx.run_id,
                    "total_items": summary.total_items,
                    "completed_items": summary.completed_items,
                    "skipped_items": summary.skipped_items,
                    "failed_items": summary.failed_items,
                    "duration_ms": timer.elapsed_ms(),
                })),
            )
            .await;

        Ok(StageRun {
            output: Arc::new(output),
            summary,
        })
    }

    /// Returns the recorded output of an already completed stage.
    fn short_circuit(&self, ctx: RunContext<'_>) -> Result<StageRun, ItemflowError> {
        let name = self.stage.name();
        let state = ctx
            .store
            .stage_state(name)
            .ok_or_else(|| crate::errors::StateError::UnknownStage(name.to_string()))?;

        let output = match ctx.outputs.read_stage(name)? {
            Some(output) => output,
            None => {
                warn!(stage = name, "Stage output missing; rebuilding from item records");
                let mut output = StageOutput::new(name, ctx.run_id);
                output.records = state
                    .items
                    .keys()
                    .filter_map(|id| self.read_previous(ctx, id))
                    .filter_map(|record| record.to_output())
                    .collect();
                ctx.outputs.write_stage(&output)?;
                output
            }
        };

        info!(stage = name, records = output.len(), "Stage already completed");
        ctx.events.try_emit(
            event_types::STAGE_RESUMED,
            Some(json!({"stage": name, "run_id": ctx.run_id, "records": output.len()})),
        );
        let summary = StageSummary::from_state(name, &state, output.len(), true);
        Ok(StageRun {
            output: Arc::new(output),
            summary,
        })
    }

    /// Applies terminal item records that outlived the last state flush.
    ///
    /// An item record counts only if the state still shows the item as
    /// non-terminal and the record is newer than the item's last reset.
    fn recover_recorded(
        &self,
        ctx: RunContext<'_>,
        items: &[WorkItem],
        finished: &mut HashMap<String, ItemRecord>,
    ) -> Result<usize, ItemflowError> {
        let name = self.stage.name();
        let mut recovered = 0;
        for item in items {
            let Some(state) = ctx.store.get(name, &item.id) else {
                continue;
            };
            if state.is_terminal() {
                continue;
            }
            let record = match ctx.outputs.read_item(name, &item.id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(stage = name, item_id = %item.id, error = %err, "Unreadable item record; item will be reprocessed");
                    continue;
                }
            };
            let stale = matches!(state.reset_at, Some(at) if record.completed_at <= at);
            if !record.status.is_terminal() || stale {
                continue;
            }
            ctx.store
                .upsert(name, &item.id, ItemUpdate::status(ItemStatus::Running))?;
            ctx.store.upsert(name, &item.id, terminal_update(&record))?;
            debug!(stage = name, item_id = %item.id, status = %record.status, "Item recovered from its record");
            finished.insert(item.id.clone(), record);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Carries one item from pending to a terminal record.
    async fn process_item(
        &self,
        ctx: RunContext<'_>,
        resolver: &DependencyResolver,
        controller: &RetryController<'_>,
        item: &WorkItem,
    ) -> Result<ItemRecord, ItemflowError> {
        let name = self.stage.name();
        let timer = SpanTimer::start();
        ctx.store
            .upsert(name, &item.id, ItemUpdate::status(ItemStatus::Running))?;

        let outcome = match resolver.resolve(item) {
            Err(unprocessable) => {
                debug!(stage = name, item_id = %item.id, %unprocessable, "Item unprocessable");
                ItemOutcome::Skipped {
                    reason: unprocessable.to_string(),
                    result: None,
                    fast_path: false,
                }
            }
            Ok(deps) => {
                let prepared = self.stage.preprocess(item, &deps).await;
                let stage = self.stage;
                controller
                    .execute(name, &item.id, prepared, |input, backend| async move {
                        stage.transform(input, &backend).await
                    })
                    .instrument(tracing::debug_span!("item", item_id = %item.id))
                    .await?
            }
        };

        Ok(build_record(name, item, outcome, timer.elapsed_ms()))
    }

    /// Applies a terminal record to state and writes its file.
    fn record_item(&self, ctx: RunContext<'_>, record: &ItemRecord) -> Result<(), ItemflowError> {
        let name = self.stage.name();
        ctx.store.upsert(name, &record.item_id, terminal_update(record))?;

        if let Err(err) = ctx.outputs.write_item(record) {
            warn!(stage = name, item_id = %record.item_id, error = %err, "Failed to write item record");
        }

        let event = match record.status {
            ItemStatus::Completed => event_types::ITEM_COMPLETED,
            ItemStatus::Skipped => event_types::ITEM_SKIPPED,
            _ => event_types::ITEM_FAILED,
        };
        ctx.events.try_emit(
            event,
            Some(json!({
                "stage": name,
                "item_id": record.item_id,
                "attempts": record.attempts,
                "backend": record.backend,
                "duration_ms": record.duration_ms,
                "fast_path": record.fast_path,
                "skip_reason": record.skip_reason,
                "error": record.error,
            })),
        );
        Ok(())
    }

    /// Reads the record of an item finished by an earlier invocation.
    fn read_previous(&self, ctx: RunContext<'_>, item_id: &str) -> Option<ItemRecord> {
        let name = self.stage.name();
        match ctx.outputs.read_item(name, item_id) {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                let state = ctx.store.get(name, item_id);
                if state.is_some_and(|s| s.status != ItemStatus::Failed) {
                    warn!(stage = name, item_id, "No record for finished item; left out of output");
                }
                None
            }
            Err(err) => {
                warn!(stage = name, item_id, error = %err, "Unreadable item record; left out of output");
                None
            }
        }
    }
}

fn build_record(stage: &str, item: &WorkItem, outcome: ItemOutcome, duration_ms: u64) -> ItemRecord {
    let mut record = ItemRecord {
        item_id: item.id.clone(),
        stage: stage.to_string(),
        status: outcome.status(),
        attempts: 0,
        backend: None,
        duration_ms,
        token_usage: None,
        fast_path: false,
        skip_reason: None,
        error: None,
        error_kind: None,
        input: item.payload.clone(),
        result: None,
        completed_at: Utc::now(),
    };
    match outcome {
        ItemOutcome::Completed {
            result,
            attempts,
            backend,
            usage,
        } => {
            record.attempts = attempts;
            record.backend = Some(backend.to_string());
            record.token_usage = Some(usage);
            record.result = Some(result);
        }
        ItemOutcome::Skipped {
            reason,
            result,
            fast_path,
        } => {
            record.skip_reason = Some(reason);
            record.result = result;
            record.fast_path = fast_path;
        }
        ItemOutcome::Failed {
            error,
            kind,
            attempts,
            backend,
        } => {
            record.attempts = attempts;
            record.backend = Some(backend.to_string());
            record.error = Some(error);
            record.error_kind = Some(kind);
        }
    }
    record
}

fn terminal_update(record: &ItemRecord) -> ItemUpdate {
    let mut update = ItemUpdate::status(record.status)
        .with_attempts(record.attempts)
        .with_duration_ms(record.duration_ms)
        .with_fast_path(record.fast_path);
    if let Some(backend) = &record.backend {
        update = update.with_backend(backend.as_str().into());
    }
    if let Some(usage) = record.token_usage {
        update = update.with_token_usage(usage);
    }
    if let (Some(error), Some(kind)) = (&record.error, &record.error_kind) {
        update = update.with_error(error.clone(), kind.clone());
    }
    if let Some(reason) = &record.skip_reason {
        update = update.with_skip_reason(reason.clone());
    }
    update
}
