use crate::error::EngineError;
use crate::recovery::recover;
use crate::tests::support::*;
use chrono::Utc;
use engine_core::invoker::scripted::{ScriptedInvoker, Step, output};
use engine_core::rows::RowOutcome;
use engine_core::store::sled_store::SledBatchStore;
use engine_core::store::{BatchStore, ExecutionPatch};
use model::batch::{BatchCounter, BatchState};
use model::execution::ExecutionState;
use model::options::{BatchDescriptor, BatchOptions};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;

fn open_store(dir: &tempfile::TempDir) -> Arc<dyn BatchStore> {
    Arc::new(SledBatchStore::open(dir.path()).unwrap())
}

fn descriptor(name: &str, options: BatchOptions) -> BatchDescriptor {
    BatchDescriptor::new(
        TEST_WORKFLOW,
        "mem://rows",
        BatchOptions {
            name: name.to_string(),
            ..options
        },
    )
}

#[tokio::test]
async fn happy_path_three_rows_in_order() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(
        ScriptedInvoker::new("q")
            .script("a", vec![Step::Succeed(output("out", "A"))])
            .script("b", vec![Step::Succeed(output("out", "B"))])
            .script("c", vec![Step::Succeed(output("out", "C"))]),
    );
    let (controller, _source, sink) =
        controller_with(store.clone(), rows_from_keys(&["a", "b", "c"]), invoker);

    let batch = controller
        .create_batch(&descriptor("happy path", BatchOptions::default()))
        .await
        .unwrap();
    assert_eq!(batch.state, BatchState::Pending);
    assert_eq!(batch.total, 3);

    controller.start_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;

    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 3);
    assert_eq!(finished.failed, 0);
    assert_eq!(finished.terminal_rows(), finished.total);
    assert_counter_bounds(&finished);
    assert_eq!(finished.result_ref, Some(format!("mem://{}", batch.id)));

    // Result rows preserve source order regardless of completion order.
    let artifact = sink.artifact(&batch.id).unwrap();
    let rendered: Vec<(usize, RowOutcome)> = artifact
        .iter()
        .map(|row| (row.row_index, row.outcome.clone()))
        .collect();
    assert_eq!(
        rendered,
        vec![
            (0, RowOutcome::Success("A".to_string())),
            (1, RowOutcome::Success("B".to_string())),
            (2, RowOutcome::Success("C".to_string())),
        ]
    );
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q").script(
        "flaky",
        vec![
            Step::TransientError("remote busy".into()),
            Step::TransientError("remote busy".into()),
            Step::Succeed(output("out", "done")),
        ],
    ));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["flaky"]), invoker);

    let batch = controller
        .create_batch(&descriptor(
            "retry then succeed",
            BatchOptions {
                retry_count: 3,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;

    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 1);

    let executions = store.find_executions(&batch.id, None).await.unwrap();
    assert_eq!(executions[0].state, ExecutionState::Success);
    assert_eq!(executions[0].retries_used, 2);
}

#[tokio::test]
async fn permanent_failure_fails_row_not_batch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(
        ScriptedInvoker::new("q").script("doomed", vec![Step::PermanentError("rejected".into())]),
    );
    let (controller, _source, sink) =
        controller_with(store.clone(), rows_from_keys(&["doomed"]), invoker.clone());

    let batch = controller
        .create_batch(&descriptor(
            "permanent failure",
            BatchOptions {
                retry_count: 5,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;

    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.failed, 1);
    assert_eq!(finished.completed, 0);
    assert_eq!(invoker.call_count(), 1);

    let executions = store.find_executions(&batch.id, None).await.unwrap();
    assert_eq!(executions[0].state, ExecutionState::Failed);
    assert_eq!(executions[0].retries_used, 0);

    let artifact = sink.artifact(&batch.id).unwrap();
    assert_eq!(
        artifact[0].outcome,
        RowOutcome::Failure("rejected".to_string())
    );
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let keys: Vec<String> = (0..10).map(|i| format!("row-{i}")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    let invoker = Arc::new(GateInvoker::new(Duration::from_millis(40)));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&key_refs), invoker.clone());

    let batch = controller
        .create_batch(&descriptor(
            "bounded",
            BatchOptions {
                max_concurrency: 3,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;

    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 10);
    assert!(
        invoker.max_in_flight() <= 3,
        "observed {} concurrent invocations",
        invoker.max_in_flight()
    );
}

#[tokio::test]
async fn single_worker_serializes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(GateInvoker::new(Duration::from_millis(15)));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["a", "b", "c"]), invoker.clone());

    let batch = controller
        .create_batch(&descriptor(
            "serialized",
            BatchOptions {
                max_concurrency: 1,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    wait_terminal(&store, &batch.id).await;

    assert_eq!(invoker.max_in_flight(), 1);
}

#[tokio::test]
async fn crash_recovery_resumes_interrupted_batch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    // Persisted state as a crashed process would leave it: two rows done,
    // one orphaned mid-invocation, two untouched.
    let batch = seed_batch(&store, &["r0", "r1", "r2", "r3", "r4"], 2, 1).await;
    let executions = store.find_executions(&batch.id, None).await.unwrap();
    for execution in &executions[..2] {
        store
            .transition_execution(
                &execution.id,
                ExecutionState::Pending,
                ExecutionPatch::claimed(Utc::now()),
            )
            .await
            .unwrap();
        store
            .transition_execution(
                &execution.id,
                ExecutionState::Running,
                ExecutionPatch::succeeded(output("out", "early"), 0.1, Utc::now()),
            )
            .await
            .unwrap();
        store
            .bump_batch_counter(&batch.id, BatchCounter::Completed, 1)
            .await
            .unwrap();
    }
    store
        .transition_execution(
            &executions[2].id,
            ExecutionState::Pending,
            ExecutionPatch::claimed(Utc::now()),
        )
        .await
        .unwrap();

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, _sink) = controller_with(store.clone(), Vec::new(), invoker);

    let report = recover(&store, &controller).await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.resumed, vec![batch.id.clone()]);
    assert!(report.failed.is_empty());

    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 5);
    assert_eq!(finished.failed, 0);
    assert_counter_bounds(&finished);

    // The orphaned row went back through the pipeline, not counted twice.
    let executions = store.find_executions(&batch.id, None).await.unwrap();
    assert!(
        executions
            .iter()
            .all(|e| e.state == ExecutionState::Success)
    );
}

#[tokio::test]
async fn recovery_finalizes_batch_with_no_pending_work() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    // All rows finished but the batch record was never finalized.
    let batch = seed_batch(&store, &["r0", "r1"], 1, 0).await;
    for execution in store.find_executions(&batch.id, None).await.unwrap() {
        store
            .transition_execution(
                &execution.id,
                ExecutionState::Pending,
                ExecutionPatch::claimed(Utc::now()),
            )
            .await
            .unwrap();
        store
            .transition_execution(
                &execution.id,
                ExecutionState::Running,
                ExecutionPatch::succeeded(output("out", "done"), 0.1, Utc::now()),
            )
            .await
            .unwrap();
    }

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, sink) = controller_with(store.clone(), Vec::new(), invoker);

    let report = recover(&store, &controller).await.unwrap();
    assert_eq!(report.finalized, vec![batch.id.clone()]);

    let finished = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(finished.state, BatchState::Completed);
    // Counters were rebuilt from the executions.
    assert_eq!(finished.completed, 2);
    assert!(sink.artifact(&batch.id).is_some());

    // A second pass over the same store state changes nothing.
    let executions_before = store.find_executions(&batch.id, None).await.unwrap();
    let report = recover(&store, &controller).await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(store.get_batch(&batch.id).await.unwrap(), finished);
    assert_eq!(
        store.find_executions(&batch.id, None).await.unwrap(),
        executions_before
    );
}

#[tokio::test]
async fn recovery_fails_batch_with_unresolvable_workflow() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let mut batch = seed_batch(&store, &["r0"], 1, 0).await;
    batch.workflow_ref = "wf-gone".to_string();
    // seed_batch fixes the workflow ref at creation; rewrite the record.
    store.create_batch(&batch).await.unwrap();

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, _sink) = controller_with(store.clone(), Vec::new(), invoker);

    let report = recover(&store, &controller).await.unwrap();
    assert_eq!(report.failed, vec![batch.id.clone()]);

    let failed = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(failed.state, BatchState::Failed);
    let message = failed.error_message.unwrap_or_default();
    assert!(message.contains("wf-gone"), "unexpected error: {message}");
}

#[tokio::test]
async fn retry_all_failed_reopens_terminal_batch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(
        ScriptedInvoker::new("q")
            .with_latency(Duration::from_millis(30))
            .script(
                "d",
                vec![
                    Step::PermanentError("flaky downstream".into()),
                    Step::Succeed(output("out", "D")),
                ],
            ),
    );
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["a", "b", "c", "d"]), invoker);

    let batch = controller
        .create_batch(&descriptor("retry all", BatchOptions::default()))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();

    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 3);
    assert_eq!(finished.failed, 1);

    let reset = controller.retry_all_failed(&batch.id).await.unwrap();
    assert_eq!(reset, 1);

    // The batch is live again with the failed row back in the queue.
    let reopened = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(reopened.state, BatchState::Running);
    assert_eq!(reopened.failed, 0);

    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 4);
    assert_eq!(finished.failed, 0);
    assert_eq!(finished.total, 4);
}

#[tokio::test]
async fn retry_single_execution_restores_full_budget() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q").script(
        "bad",
        vec![
            Step::PermanentError("rejected".into()),
            Step::Succeed(output("out", "fixed")),
        ],
    ));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["bad"]), invoker);

    let batch = controller
        .create_batch(&descriptor("retry one", BatchOptions::default()))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    wait_terminal(&store, &batch.id).await;

    let failed = controller.get_failed_executions(&batch.id).await.unwrap();
    assert_eq!(failed.len(), 1);

    controller
        .retry_execution(&batch.id, &failed[0].id)
        .await
        .unwrap();

    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 1);
    assert_eq!(finished.failed, 0);

    let executions = store.find_executions(&batch.id, None).await.unwrap();
    assert_eq!(executions[0].state, ExecutionState::Success);
    assert_eq!(executions[0].retries_used, 0);
    assert!(executions[0].error_message.is_none());
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, _sink) = controller_with(store.clone(), Vec::new(), invoker);

    let batch = controller
        .create_batch(&descriptor("empty", BatchOptions::default()))
        .await
        .unwrap();
    assert_eq!(batch.total, 0);

    controller.start_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;

    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 0);
    assert_eq!(finished.failed, 0);
    assert_eq!(finished.skipped, 0);
}

#[tokio::test]
async fn pause_stops_claiming_and_resume_finishes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let keys: Vec<String> = (0..6).map(|i| format!("row-{i}")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let invoker = Arc::new(
        ScriptedInvoker::new("q").with_latency(Duration::from_millis(50)),
    );
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&key_refs), invoker);

    let batch = controller
        .create_batch(&descriptor(
            "pausable",
            BatchOptions {
                max_concurrency: 1,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();

    sleep(Duration::from_millis(60)).await;
    controller.pause_batch(&batch.id).await.unwrap();

    let paused = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(paused.state, BatchState::Paused);
    assert!(controller.is_running(&batch.id).await);

    // No new rows get claimed while paused; the in-flight one may finish.
    sleep(Duration::from_millis(200)).await;
    let stats = store.execution_stats(&batch.id).await.unwrap();
    assert!(stats.pending > 0, "paused batch kept claiming rows");

    controller.resume_batch(&batch.id).await.unwrap();
    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);
    assert_eq!(finished.completed, 6);
}

#[tokio::test]
async fn stop_cancels_and_leaves_residual_rows_unfinished() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let keys: Vec<String> = (0..5).map(|i| format!("row-{i}")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let invoker = Arc::new(
        ScriptedInvoker::new("q").with_latency(Duration::from_millis(80)),
    );
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&key_refs), invoker);

    let batch = controller
        .create_batch(&descriptor(
            "stoppable",
            BatchOptions {
                max_concurrency: 1,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    controller.stop_batch(&batch.id).await.unwrap();

    let stopped = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(stopped.state, BatchState::Cancelled);
    assert!(stopped.completed_at.is_some());
    assert!(!controller.is_running(&batch.id).await);

    // Cancellation leaves non-terminal residue for recovery, never a
    // double-counted row.
    let stats = store.execution_stats(&batch.id).await.unwrap();
    assert!(stats.terminal() < stats.total);
    let loaded = store.get_batch(&batch.id).await.unwrap();
    assert_counter_bounds(&loaded);
}

#[tokio::test]
async fn invalid_lifecycle_requests_are_rejected_without_side_effects() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["a"]), invoker);

    let batch = controller
        .create_batch(&descriptor("lifecycle", BatchOptions::default()))
        .await
        .unwrap();

    // Pause before start.
    let err = controller.pause_batch(&batch.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    assert_eq!(
        store.get_batch(&batch.id).await.unwrap().state,
        BatchState::Pending
    );

    controller.start_batch(&batch.id).await.unwrap();
    wait_terminal(&store, &batch.id).await;

    // Resume a terminal batch.
    let err = controller.resume_batch(&batch.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    // Start a completed batch; re-opening is reserved for retry.
    let err = controller.start_batch(&batch.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    // Unknown ids surface NotFound.
    let err = controller.get_batch("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn validation_rejects_bad_options() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["a"]), invoker);

    let err = controller
        .create_batch(&descriptor(
            "bad",
            BatchOptions {
                max_concurrency: 0,
                ..BatchOptions::default()
            },
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationFailed(_)));
}

#[tokio::test]
async fn delete_discards_artifacts_and_records() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(ScriptedInvoker::new("q"));
    let (controller, source, sink) =
        controller_with(store.clone(), rows_from_keys(&["a", "b"]), invoker);

    let batch = controller
        .create_batch(&descriptor("deletable", BatchOptions::default()))
        .await
        .unwrap();
    controller.start_batch(&batch.id).await.unwrap();
    wait_terminal(&store, &batch.id).await;

    controller.delete_batch(&batch.id).await.unwrap();

    assert!(matches!(
        controller.get_batch(&batch.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(store.find_executions(&batch.id, None).await.unwrap().is_empty());
    assert_eq!(source.discarded(), vec![batch.id.clone()]);
    assert_eq!(sink.discarded(), vec![batch.id.clone()]);
}

#[tokio::test]
async fn progress_snapshots_track_a_running_batch() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let invoker = Arc::new(
        ScriptedInvoker::new("q").with_latency(Duration::from_millis(30)),
    );
    let (controller, _source, _sink) =
        controller_with(store.clone(), rows_from_keys(&["a", "b", "c"]), invoker);

    let batch = controller
        .create_batch(&descriptor("tracked", BatchOptions::default()))
        .await
        .unwrap();
    let tracker = controller.tracker();

    controller.start_batch(&batch.id).await.unwrap();
    let mut updates = tracker.subscribe(&batch.id).await;
    let first = updates.recv().await.expect("at least one snapshot");
    assert_eq!(first.total, 3);

    let finished = wait_terminal(&store, &batch.id).await;
    assert_eq!(finished.state, BatchState::Completed);

    let snapshot = tracker.snapshot_now(&batch.id).await.unwrap();
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.progress_percentage, 100.0);
}
