//! End-to-end tests for pipeline execution and resumption.

#[cfg(test)]
mod tests {
    use crate::backend::BackendId;
    use crate::config::EngineConfig;
    use crate::core::{ItemStatus, RunStatus, StageOutput, StageStatus, WorkItem};
    use crate::dependencies::{DependencyDeclaration, RunSelector};
    use crate::errors::ItemflowError;
    use crate::events::{event_types, CollectingEventSink};
    use crate::pipeline::{Pipeline, RetryPolicy, RunSession};
    use crate::testing::{assert_item, assert_stage_counts, ScriptedStage};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn by_id(stage: &str) -> DependencyDeclaration {
        DependencyDeclaration::same_run(stage).with_key("id", "id")
    }

    fn single_stage(stage: &Arc<ScriptedStage>, config: EngineConfig) -> Pipeline {
        Pipeline::builder("provisions")
            .stage(stage.clone())
            .unwrap()
            .with_config(config)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_retry_escalation_and_exhaustion() {
        let stage = Arc::new(
            ScriptedStage::new("extract", 5)
                .failing("3", 2)
                .always_failing("5")
                .with_default_latency(Duration::from_millis(20)),
        );
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = Pipeline::builder("provisions")
            .stage(stage.clone())
            .unwrap()
            .with_config(EngineConfig::default().with_concurrency(2))
            .with_event_sink(events.clone())
            .build()
            .unwrap();
        let session = RunSession::in_memory(&pipeline);

        let report = pipeline.run(&session).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_stage_counts(&report, "extract", 4, 0, 1);
        let summary = report.stage("extract").unwrap();
        assert_eq!(summary.total_items, 5);
        assert_eq!(summary.status, StageStatus::Completed);
        assert_eq!(summary.output_records, 4);

        let store = session.store();
        assert_item(store, "extract", "3", ItemStatus::Completed, 3);
        assert_item(store, "extract", "5", ItemStatus::Failed, 3);
        assert_eq!(
            store.get("extract", "3").unwrap().backend,
            Some(BackendId::escalated())
        );
        assert_eq!(
            stage.calls_for("3"),
            vec![
                BackendId::default_backend(),
                BackendId::default_backend(),
                BackendId::escalated(),
            ]
        );
        let failed = store.get("extract", "5").unwrap();
        assert_eq!(failed.error_kind.as_deref(), Some("malformed_output"));
        assert!(failed.error.unwrap().contains("scripted failure 3"));

        let record = session.outputs().read_item("extract", "5").unwrap().unwrap();
        assert_eq!(record.status, ItemStatus::Failed);
        assert_eq!(record.backend.as_deref(), Some("escalated"));

        assert_eq!(events.count(event_types::ITEM_RETRY), 4);
        assert_eq!(events.count(event_types::ITEM_FAILED), 1);
        assert_eq!(events.count(event_types::ITEM_COMPLETED), 4);
        assert_eq!(events.count(event_types::PIPELINE_COMPLETED), 1);
        assert_eq!(report.token_usage.total_tokens(), 4 * 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling_respected() {
        let mut stage = ScriptedStage::new("extract", 20);
        for i in 1..=20u64 {
            stage = stage.with_latency(i.to_string(), Duration::from_millis(5 + (i * 7) % 40));
        }
        let stage = Arc::new(stage);
        let pipeline = single_stage(&stage, EngineConfig::default().with_concurrency(3));

        pipeline.run(&RunSession::in_memory(&pipeline)).await.unwrap();

        assert_eq!(stage.call_count(), 20);
        assert_eq!(stage.probe().peak(), 3);
        assert_eq!(stage.probe().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_concurrency_override() {
        let stage = Arc::new(
            ScriptedStage::new("extract", 6)
                .with_concurrency(4)
                .with_default_latency(Duration::from_millis(10)),
        );
        let pipeline = single_stage(&stage, EngineConfig::default().with_concurrency(1));

        pipeline.run(&RunSession::in_memory(&pipeline)).await.unwrap();

        assert_eq!(stage.probe().peak(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_admission() {
        // One slow item holds a slot while the other slot drains the rest.
        // Fixed batches of two would take 100 + 3 * 10 ms.
        let stage = Arc::new(
            ScriptedStage::new("extract", 8)
                .with_default_latency(Duration::from_millis(10))
                .with_latency("1", Duration::from_millis(100)),
        );
        let pipeline = single_stage(&stage, EngineConfig::default().with_concurrency(2));

        let start = Instant::now();
        pipeline.run(&RunSession::in_memory(&pipeline)).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(120), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_composite_key_join_and_required_skip() {
        let decisions = Arc::new(ScriptedStage::new("decisions", 0).with_items(vec![
            WorkItem::new("d1", json!({"court": "A", "number": 1, "title": "first"})),
            WorkItem::new("d2", json!({"court": "B", "number": 2, "title": "second"})),
        ]));
        let citations = Arc::new(
            ScriptedStage::new("citations", 0)
                .with_items(vec![
                    WorkItem::new("c1", json!({"court": "C", "num": 3})),
                    WorkItem::new("c2", json!({"court": "B", "num": 2.0})),
                ])
                .with_dependency(
                    DependencyDeclaration::same_run("decisions")
                        .with_key("court", "court")
                        .with_key("num", "number"),
                ),
        );
        let pipeline = Pipeline::builder("provisions")
            .stage(decisions.clone())
            .unwrap()
            .stage(citations.clone())
            .unwrap()
            .build()
            .unwrap();
        let session = RunSession::in_memory(&pipeline);

        let report = pipeline.run(&session).await.unwrap();

        assert_stage_counts(&report, "citations", 1, 1, 0);
        assert_eq!(citations.calls_for("c1"), Vec::<BackendId>::new());

        let skipped = session.store().get("citations", "c1").unwrap();
        assert_eq!(skipped.status, ItemStatus::Skipped);
        assert!(!skipped.fast_path);
        assert_eq!(
            skipped.skip_reason.as_deref(),
            Some("required dependency 'decisions' has no record for key (C, 3)")
        );

        let output = session.outputs().read_stage("citations").unwrap().unwrap();
        assert_eq!(output.len(), 1);
        let joined = &output.get("c2").unwrap().result["deps"]["decisions"];
        assert_eq!(joined["id"], "d2");
        assert_eq!(joined["input"]["title"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_dependency_passes_no_data() {
        let upstream = Arc::new(ScriptedStage::new("extract", 1));
        let downstream = Arc::new(
            ScriptedStage::new("enrich", 2).with_dependency(by_id("extract").optional()),
        );
        let pipeline = Pipeline::builder("provisions")
            .stage(upstream)
            .unwrap()
            .stage(downstream.clone())
            .unwrap()
            .build()
            .unwrap();
        let session = RunSession::in_memory(&pipeline);

        let report = pipeline.run(&session).await.unwrap();

        assert_stage_counts(&report, "enrich", 2, 0, 0);
        let output = session.outputs().read_stage("enrich").unwrap().unwrap();
        assert_eq!(output.get("1").unwrap().result["deps"]["extract"]["id"], "1");
        assert_eq!(output.get("2").unwrap().result["deps"], json!({"extract": null}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_makes_no_backend_call() {
        let stage = Arc::new(ScriptedStage::new("extract", 3).fast_path("2"));
        let pipeline = single_stage(&stage, EngineConfig::default());
        let session = RunSession::in_memory(&pipeline);

        let report = pipeline.run(&session).await.unwrap();

        assert_stage_counts(&report, "extract", 2, 1, 0);
        assert_eq!(report.stage("extract").unwrap().fast_path_items, 1);
        assert_eq!(stage.call_count(), 2);
        assert!(stage.calls_for("2").is_empty());
        assert_item(session.store(), "extract", "2", ItemStatus::Skipped, 0);

        let output = session.outputs().read_stage("extract").unwrap().unwrap();
        let ids: Vec<_> = output.records.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(output.get("2").unwrap().fast_path);
        assert_eq!(output.get("2").unwrap().result["fast"], true);
    }

    #[tokio::test]
    async fn test_empty_stage_completes_with_zero_totals() {
        let stage = Arc::new(ScriptedStage::new("extract", 0));
        let pipeline = single_stage(&stage, EngineConfig::default());
        let session = RunSession::in_memory(&pipeline);

        let report = pipeline.run(&session).await.unwrap();

        assert_stage_counts(&report, "extract", 0, 0, 0);
        let summary = report.stage("extract").unwrap();
        assert_eq!(summary.total_items, 0);
        assert_eq!(summary.status, StageStatus::Completed);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_loader_error_halts_run() {
        let extract = Arc::new(ScriptedStage::new("extract", 2).with_loader_error("source offline"));
        let enrich = Arc::new(ScriptedStage::new("enrich", 2));
        let pipeline = Pipeline::builder("provisions")
            .stage(extract)
            .unwrap()
            .stage(enrich.clone())
            .unwrap()
            .build()
            .unwrap();
        let session = RunSession::in_memory(&pipeline);

        let err = pipeline.run(&session).await.unwrap_err();

        assert!(matches!(err, ItemflowError::Loader { ref stage, .. } if stage == "extract"));
        assert!(err.to_string().contains("source offline"));
        assert_eq!(enrich.load_count(), 0);
        assert_eq!(session.store().run_status(), RunStatus::Running);
    }

    #[tokio::test]
    async fn test_duplicate_item_ids_are_fatal() {
        let stage = Arc::new(ScriptedStage::new("extract", 0).with_items(vec![
            WorkItem::new("1", json!({})),
            WorkItem::new("1", json!({})),
        ]));
        let pipeline = single_stage(&stage, EngineConfig::default());

        let err = pipeline
            .run(&RunSession::in_memory(&pipeline))
            .await
            .unwrap_err();

        assert!(matches!(err, ItemflowError::DuplicateItem { ref item_id, .. } if item_id == "1"));
        assert_eq!(stage.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_item_is_reprocessed_on_next_run() {
        let stage = Arc::new(ScriptedStage::new("extract", 3).failing("2", 3));
        let pipeline = single_stage(&stage, EngineConfig::default());
        let session = RunSession::in_memory(&pipeline);

        let first = pipeline.run(&session).await.unwrap();
        assert_stage_counts(&first, "extract", 2, 0, 1);
        assert_eq!(stage.call_count(), 5);

        // Failures are final until reset.
        let again = pipeline.run(&session).await.unwrap();
        assert!(again.stage("extract").unwrap().resumed);
        assert_eq!(stage.call_count(), 5);

        let previous = session.store().reset_item("extract", "2").unwrap().unwrap();
        assert_eq!(previous.status, ItemStatus::Failed);
        assert_eq!(session.store().stage_status("extract"), Some(StageStatus::Running));

        let second = pipeline.run(&session).await.unwrap();

        assert_stage_counts(&second, "extract", 3, 0, 0);
        assert_eq!(stage.call_count(), 6);
        assert_eq!(stage.calls_for("1").len(), 1);
        assert_item(session.store(), "extract", "2", ItemStatus::Completed, 1);
        let output = session.outputs().read_stage("extract").unwrap().unwrap();
        assert_eq!(output.len(), 3);
    }

    struct ThreeStages {
        extract: Arc<ScriptedStage>,
        enrich: Arc<ScriptedStage>,
        summarize: Arc<ScriptedStage>,
        pipeline: Pipeline,
    }

    fn three_stages(hang: Option<&str>) -> ThreeStages {
        let extract = Arc::new(
            ScriptedStage::new("extract", 4)
                .failing("4", 1)
                .with_default_latency(Duration::from_millis(10)),
        );
        let enrich = Arc::new(
            ScriptedStage::new("enrich", 4)
                .fast_path("2")
                .with_dependency(by_id("extract"))
                .with_default_latency(Duration::from_millis(10)),
        );
        let mut summarize = ScriptedStage::new("summarize", 4)
            .with_dependency(by_id("enrich"))
            .with_default_latency(Duration::from_millis(10));
        if let Some(id) = hang {
            summarize = summarize.hanging(id);
        }
        let summarize = Arc::new(summarize);
        let pipeline = Pipeline::builder("provisions")
            .stage(extract.clone())
            .unwrap()
            .stage(enrich.clone())
            .unwrap()
            .stage(summarize.clone())
            .unwrap()
            .with_config(
                EngineConfig::default()
                    .with_concurrency(2)
                    .with_flush(1, 500)
                    .with_retry(RetryPolicy::default().with_retry_delay_ms(50)),
            )
            .build()
            .unwrap();
        ThreeStages {
            extract,
            enrich,
            summarize,
            pipeline,
        }
    }

    fn item_results(session: &RunSession) -> Vec<(String, String, ItemStatus, u32, Option<serde_json::Value>)> {
        let mut results = Vec::new();
        for stage in ["extract", "enrich", "summarize"] {
            for id in ["1", "2", "3", "4"] {
                let record = session.outputs().read_item(stage, id).unwrap().unwrap();
                results.push((
                    stage.to_string(),
                    id.to_string(),
                    record.status,
                    record.attempts,
                    record.result,
                ));
            }
        }
        results
    }

    fn stage_records(session: &RunSession, stage: &str) -> StageOutput {
        let mut output = session.outputs().read_stage(stage).unwrap().unwrap();
        output.run_id.clear();
        output
    }

    async fn uninterrupted(root: &Path) -> RunSession {
        let run = three_stages(None);
        let session = RunSession::create(&run.pipeline, root).unwrap();
        let report = run.pipeline.run(&session).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();

        let interrupted = three_stages(Some("3"));
        let session = RunSession::create(&interrupted.pipeline, dir.path()).unwrap();
        let run_id = session.run_id();
        let state_file = session.layout().unwrap().state_path();
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), interrupted.pipeline.run(&session)).await;
        assert!(outcome.is_err(), "run should have been cut off");
        drop(session);

        assert!(state_file.exists());

        let resumed = three_stages(None);
        let session = RunSession::resume(&resumed.pipeline, dir.path(), &run_id).unwrap();
        assert_eq!(session.store().stage_status("enrich"), Some(StageStatus::Completed));
        assert_eq!(session.store().get("summarize", "3").unwrap().status, ItemStatus::Pending);

        let report = resumed.pipeline.run(&session).await.unwrap();

        assert!(report.resumed);
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.stage("extract").unwrap().resumed);
        assert!(report.stage("enrich").unwrap().resumed);
        assert!(!report.stage("summarize").unwrap().resumed);
        assert_eq!(resumed.extract.load_count(), 0);
        assert_eq!(resumed.extract.call_count(), 0);
        assert_eq!(resumed.enrich.call_count(), 0);
        assert_eq!(
            resumed.summarize.calls(),
            vec![("3".to_string(), BackendId::default_backend())]
        );
        assert_stage_counts(&report, "extract", 4, 0, 0);
        assert_stage_counts(&report, "enrich", 3, 1, 0);
        assert_stage_counts(&report, "summarize", 4, 0, 0);
        assert_item(session.store(), "extract", "4", ItemStatus::Completed, 2);

        let reference_dir = TempDir::new().unwrap();
        let reference = uninterrupted(reference_dir.path()).await;

        assert_eq!(item_results(&session), item_results(&reference));
        for stage in ["extract", "enrich", "summarize"] {
            assert_eq!(stage_records(&session, stage), stage_records(&reference, stage));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_adopts_item_records_written_after_last_flush() {
        let dir = TempDir::new().unwrap();
        let config = || {
            EngineConfig::default()
                .with_concurrency(4)
                .with_flush(100, 60_000)
        };

        let hanging = Arc::new(ScriptedStage::new("extract", 4).hanging("4"));
        let pipeline = single_stage(&hanging, config());
        let session = RunSession::create(&pipeline, dir.path()).unwrap();
        let run_id = session.run_id();
        let outcome = tokio::time::timeout(Duration::from_secs(1), pipeline.run(&session)).await;
        assert!(outcome.is_err(), "run should have been cut off");
        let on_disk = session.outputs().read_item("extract", "1").unwrap().unwrap();
        assert_eq!(on_disk.status, ItemStatus::Completed);
        drop(session);

        let stage = Arc::new(ScriptedStage::new("extract", 4));
        let pipeline = single_stage(&stage, config());
        let session = RunSession::resume(&pipeline, dir.path(), &run_id).unwrap();
        assert_eq!(session.store().get("extract", "1").unwrap().status, ItemStatus::Pending);

        let report = pipeline.run(&session).await.unwrap();

        assert_eq!(
            stage.calls(),
            vec![("4".to_string(), BackendId::default_backend())]
        );
        assert_stage_counts(&report, "extract", 4, 0, 0);
        assert_item(session.store(), "extract", "1", ItemStatus::Completed, 1);
        assert_eq!(report.token_usage.total_tokens(), 4 * 15);
        let output = session.outputs().read_stage("extract").unwrap().unwrap();
        let ids: Vec<_> = output.records.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_resume_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let run_id = uninterrupted(dir.path()).await.run_id();

        let again = three_stages(None);
        let session = RunSession::resume(&again.pipeline, dir.path(), &run_id).unwrap();
        let report = again.pipeline.run(&session).await.unwrap();

        assert!(report.stages.iter().all(|s| s.resumed));
        assert_eq!(
            again.extract.call_count() + again.enrich.call_count() + again.summarize.call_count(),
            0
        );
        assert_eq!(report.stage("summarize").unwrap().output_records, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prior_run_dependency() {
        let dir = TempDir::new().unwrap();
        let extract = Arc::new(ScriptedStage::new("extract", 3));
        let first = single_stage(&extract, EngineConfig::default());
        let first_session = RunSession::create(&first, dir.path()).unwrap();
        first.run(&first_session).await.unwrap();

        let review = Arc::new(ScriptedStage::new("review", 4).with_dependency(
            DependencyDeclaration::prior_run("extract", RunSelector::LatestCompleted)
                .with_key("id", "id"),
        ));
        let second = single_stage(&review, EngineConfig::default());
        let session = RunSession::create(&second, dir.path()).unwrap();

        let report = second.run(&session).await.unwrap();

        assert_stage_counts(&report, "review", 3, 1, 0);
        assert!(review.calls_for("4").is_empty());
        let output = session.outputs().read_stage("review").unwrap().unwrap();
        assert_eq!(output.get("2").unwrap().result["deps"]["extract"]["id"], "2");
    }

    #[tokio::test]
    async fn test_prior_run_dependency_without_prior_run_is_fatal() {
        let dir = TempDir::new().unwrap();
        let review = Arc::new(ScriptedStage::new("review", 1).with_dependency(
            DependencyDeclaration::prior_run("extract", RunSelector::LatestCompleted)
                .with_key("id", "id"),
        ));
        let pipeline = single_stage(&review, EngineConfig::default());
        let session = RunSession::create(&pipeline, dir.path()).unwrap();

        let err = pipeline.run(&session).await.unwrap_err();

        assert!(matches!(err, ItemflowError::DependencyUnavailable { .. }));
        assert_eq!(review.call_count(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_run_id() {
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(ScriptedStage::new("extract", 1));
        let pipeline = single_stage(&stage, EngineConfig::default());

        RunSession::create_with_id(&pipeline, dir.path(), "fixed").unwrap();
        let err = RunSession::create_with_id(&pipeline, dir.path(), "fixed").unwrap_err();

        assert!(matches!(err, ItemflowError::Config(_)));
    }
}
