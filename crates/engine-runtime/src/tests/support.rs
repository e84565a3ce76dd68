use crate::controller::{BatchController, ControllerParams};
use crate::scheduler::{BatchScheduler, SchedulerDeps, SchedulerError, SchedulerOutcome};
use async_trait::async_trait;
use chrono::Utc;
use engine_core::backoff::BackoffPolicy;
use engine_core::error::{InvokeError, SinkError, SourceError};
use engine_core::invoker::{StaticInvokerProvider, WorkflowInvoker};
use engine_core::metrics::Metrics;
use engine_core::rows::{JoinFormatter, ResultSink, RowResult, RowSource};
use engine_core::store::{BatchPatch, BatchStore};
use model::batch::{Batch, BatchState};
use model::options::BatchOptions;
use model::value::{InputMap, OutputMap, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const TEST_WORKFLOW: &str = "wf-test";

/// Build `q`-column rows from a list of keys.
pub fn rows_from_keys(keys: &[&str]) -> Vec<(usize, InputMap)> {
    keys.iter()
        .enumerate()
        .map(|(index, key)| {
            let mut inputs = InputMap::new();
            inputs.insert("q".to_string(), Value::from(*key));
            (index, inputs)
        })
        .collect()
}

/// Row source serving the same fixed row set for every batch id.
pub struct MemoryRowSource {
    rows: Vec<(usize, InputMap)>,
    discarded: Mutex<Vec<String>>,
}

impl MemoryRowSource {
    pub fn new(rows: Vec<(usize, InputMap)>) -> Self {
        MemoryRowSource {
            rows,
            discarded: Mutex::new(Vec::new()),
        }
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn rows(&self, _batch_id: &str) -> Result<Vec<(usize, InputMap)>, SourceError> {
        Ok(self.rows.clone())
    }

    async fn discard(&self, batch_id: &str) -> Result<(), SourceError> {
        self.discarded.lock().unwrap().push(batch_id.to_string());
        Ok(())
    }
}

/// Result sink capturing assembled artifacts in memory.
pub struct MemoryResultSink {
    artifacts: Mutex<HashMap<String, Vec<RowResult>>>,
    discarded: Mutex<Vec<String>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        MemoryResultSink {
            artifacts: Mutex::new(HashMap::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    pub fn artifact(&self, batch_id: &str) -> Option<Vec<RowResult>> {
        self.artifacts.lock().unwrap().get(batch_id).cloned()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn assemble(&self, batch_id: &str, results: &[RowResult]) -> Result<String, SinkError> {
        self.artifacts
            .lock()
            .unwrap()
            .insert(batch_id.to_string(), results.to_vec());
        Ok(format!("mem://{batch_id}"))
    }

    async fn discard(&self, batch_id: &str) -> Result<(), SinkError> {
        self.artifacts.lock().unwrap().remove(batch_id);
        self.discarded.lock().unwrap().push(batch_id.to_string());
        Ok(())
    }
}

/// Invoker that holds each call open for a while and records the maximum
/// number of simultaneously open calls.
pub struct GateInvoker {
    hold: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GateInvoker {
    pub fn new(hold: Duration) -> Self {
        GateInvoker {
            hold,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowInvoker for GateInvoker {
    async fn invoke(&self, _inputs: &InputMap) -> Result<OutputMap, InvokeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(OutputMap::new())
    }
}

/// Create a batch with one execution per key and move it to Running, the
/// state a scheduler expects to find.
pub async fn seed_batch(
    store: &Arc<dyn BatchStore>,
    keys: &[&str],
    max_concurrency: usize,
    retry_count: u32,
) -> Batch {
    let options = BatchOptions {
        name: "seeded".to_string(),
        max_concurrency,
        retry_count,
        ..BatchOptions::default()
    };
    let batch = Batch::new(TEST_WORKFLOW, "mem://rows", &options);
    store.create_batch(&batch).await.unwrap();
    store
        .create_executions(&batch.id, &rows_from_keys(keys))
        .await
        .unwrap();
    store
        .update_batch(
            &batch.id,
            BatchPatch::to_state(BatchState::Running).with_started(Utc::now()),
        )
        .await
        .unwrap()
}

/// Run a scheduler for the batch with instant backoff and no pause/cancel.
pub async fn run_scheduler(
    store: &Arc<dyn BatchStore>,
    batch: &Batch,
    invoker: Arc<dyn WorkflowInvoker>,
    sink: Arc<dyn ResultSink>,
) -> Result<SchedulerOutcome, SchedulerError> {
    let (_pause_tx, pause_rx) = watch::channel(false);
    let scheduler = BatchScheduler::new(
        batch,
        SchedulerDeps {
            store: store.clone(),
            invoker,
            sink,
            formatter: Arc::new(JoinFormatter::default()),
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
            metrics: Metrics::new(),
            cancel: CancellationToken::new(),
            pause: pause_rx,
            lifecycle: Arc::new(AsyncMutex::new(())),
        },
    );
    scheduler.run().await
}

/// Controller wired to in-memory capabilities and instant backoff.
pub fn controller_with(
    store: Arc<dyn BatchStore>,
    rows: Vec<(usize, InputMap)>,
    invoker: Arc<dyn WorkflowInvoker>,
) -> (BatchController, Arc<MemoryRowSource>, Arc<MemoryResultSink>) {
    let source = Arc::new(MemoryRowSource::new(rows));
    let sink = Arc::new(MemoryResultSink::new());
    let invokers = Arc::new(StaticInvokerProvider::new().with_workflow(TEST_WORKFLOW, invoker));

    let params = ControllerParams::new(store, source.clone(), sink.clone(), invokers)
        .with_backoff(BackoffPolicy::new(Duration::ZERO, Duration::ZERO))
        .with_progress_interval(Duration::from_millis(25));
    (BatchController::new(params), source, sink)
}

/// Poll until the batch reaches a terminal state.
pub async fn wait_terminal(store: &Arc<dyn BatchStore>, batch_id: &str) -> Batch {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let batch = store.get_batch(batch_id).await.unwrap();
            if batch.is_terminal() {
                return batch;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch did not reach a terminal state in time")
}

/// Counter-bound checks that must hold at any observation point.
pub fn assert_counter_bounds(batch: &Batch) {
    assert!(batch.completed <= batch.total, "completed > total");
    assert!(batch.failed <= batch.total, "failed > total");
    assert!(batch.skipped <= batch.total, "skipped > total");
    assert!(
        batch.terminal_rows() <= batch.total,
        "terminal rows exceed total"
    );
}
