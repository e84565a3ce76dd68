use crate::error::EngineError;
use crate::progress::ProgressTracker;
use crate::scheduler::{BatchScheduler, SchedulerDeps, row_results};
use chrono::Utc;
use engine_core::backoff::BackoffPolicy;
use engine_core::invoker::InvokerProvider;
use engine_core::metrics::{Metrics, MetricsSnapshot};
use engine_core::rows::{JoinFormatter, OutputFormatter, ResultSink, RowSource};
use engine_core::store::{BatchFilter, BatchPage, BatchPatch, BatchStore, ExecutionPatch, Page};
use model::batch::{Batch, BatchCounter, BatchState};
use model::execution::{Execution, ExecutionState};
use model::options::BatchDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Collaborators and tuning for a controller.
pub struct ControllerParams {
    pub store: Arc<dyn BatchStore>,
    pub source: Arc<dyn RowSource>,
    pub sink: Arc<dyn ResultSink>,
    pub invokers: Arc<dyn InvokerProvider>,
    pub formatter: Arc<dyn OutputFormatter>,
    pub backoff: BackoffPolicy,
    pub max_running_batches: usize,
    pub progress_interval: Duration,
}

impl ControllerParams {
    pub fn new(
        store: Arc<dyn BatchStore>,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn ResultSink>,
        invokers: Arc<dyn InvokerProvider>,
    ) -> Self {
        ControllerParams {
            store,
            source,
            sink,
            invokers,
            formatter: Arc::new(JoinFormatter::default()),
            backoff: BackoffPolicy::default(),
            max_running_batches: 8,
            progress_interval: Duration::from_secs(2),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn OutputFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_running_batches(mut self, max: usize) -> Self {
        self.max_running_batches = max.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

struct RunningBatch {
    // Distinguishes this entry from a successor registered under the same
    // batch id, so a finishing task only ever deregisters itself.
    generation: u64,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Batch lifecycle owner: creates batches, launches and signals their
/// schedulers, and routes retry operations. The in-memory registry of
/// running schedulers is process-local; recovery rebuilds it from the store
/// at startup.
pub struct BatchController {
    store: Arc<dyn BatchStore>,
    source: Arc<dyn RowSource>,
    sink: Arc<dyn ResultSink>,
    invokers: Arc<dyn InvokerProvider>,
    formatter: Arc<dyn OutputFormatter>,
    backoff: BackoffPolicy,
    metrics: Metrics,
    tracker: Arc<ProgressTracker>,
    max_running_batches: usize,
    registry: Arc<Mutex<HashMap<String, RunningBatch>>>,
    next_generation: AtomicU64,
    // Serializes lifecycle calls per batch so state-machine checks are
    // race-free. Schedulers hold the same mutex while deciding their
    // terminal state.
    lifecycle: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BatchController {
    pub fn new(params: ControllerParams) -> Self {
        let tracker = Arc::new(ProgressTracker::new(
            params.store.clone(),
            params.progress_interval,
        ));
        BatchController {
            store: params.store,
            source: params.source,
            sink: params.sink,
            invokers: params.invokers,
            formatter: params.formatter,
            backoff: params.backoff,
            metrics: Metrics::new(),
            tracker,
            max_running_batches: params.max_running_batches,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        self.tracker.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn lifecycle_lock(&self, batch_id: &str) -> Arc<Mutex<()>> {
        self.lifecycle
            .lock()
            .await
            .entry(batch_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist a batch and one pending execution per source row, in a
    /// single store transaction for the rows.
    pub async fn create_batch(&self, descriptor: &BatchDescriptor) -> Result<Batch, EngineError> {
        descriptor.options.validate()?;

        let batch = Batch::new(
            &descriptor.workflow_ref,
            &descriptor.source_ref,
            &descriptor.options,
        );

        // Rows are pulled before anything is persisted so a bad source
        // leaves no half-created batch behind.
        let rows = self
            .source
            .rows(&batch.id)
            .await
            .map_err(|err| EngineError::ValidationFailed(format!("row source: {err}")))?;

        self.store.create_batch(&batch).await?;
        self.store.create_executions(&batch.id, &rows).await?;

        let batch = self.store.get_batch(&batch.id).await?;
        info!(batch_id = %batch.id, rows = batch.total, "batch created");
        Ok(batch)
    }

    pub async fn start_batch(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;

        {
            let registry = self.registry.lock().await;
            if registry.contains_key(id) {
                return Err(EngineError::InvalidStateTransition {
                    from: "running".to_string(),
                    to: "running".to_string(),
                });
            }
            if registry.len() >= self.max_running_batches {
                return Err(EngineError::CapacityExceeded(format!(
                    "{} batches already running",
                    registry.len()
                )));
            }
        }

        // Only a fresh batch starts here; paused batches go through resume
        // and finished ones through the retry operations.
        let batch = self.store.get_batch(id).await?;
        if batch.state != BatchState::Pending {
            return Err(EngineError::InvalidStateTransition {
                from: batch.state.to_string(),
                to: BatchState::Running.to_string(),
            });
        }

        let batch = self
            .store
            .update_batch(
                id,
                BatchPatch::to_state(BatchState::Running).with_started(Utc::now()),
            )
            .await?;
        self.launch(batch).await
    }

    pub async fn pause_batch(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;

        let batch = self.store.get_batch(id).await?;
        if batch.state != BatchState::Running {
            return Err(EngineError::InvalidStateTransition {
                from: batch.state.to_string(),
                to: BatchState::Paused.to_string(),
            });
        }

        self.store
            .update_batch(id, BatchPatch::to_state(BatchState::Paused))
            .await?;
        if let Some(running) = self.registry.lock().await.get(id) {
            let _ = running.pause_tx.send(true);
        }
        info!(batch_id = %id, "batch paused");
        Ok(())
    }

    pub async fn resume_batch(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;

        let batch = self.store.get_batch(id).await?;
        if batch.state != BatchState::Paused {
            return Err(EngineError::InvalidStateTransition {
                from: batch.state.to_string(),
                to: BatchState::Running.to_string(),
            });
        }

        let batch = self
            .store
            .update_batch(id, BatchPatch::to_state(BatchState::Running))
            .await?;

        let resumed_in_place = {
            let registry = self.registry.lock().await;
            match registry.get(id) {
                Some(running) => {
                    let _ = running.pause_tx.send(false);
                    true
                }
                None => false,
            }
        };
        if !resumed_in_place {
            // Paused across a restart: no live scheduler, so launch one over
            // the existing pending set.
            self.launch(batch).await?;
        }
        info!(batch_id = %id, "batch resumed");
        Ok(())
    }

    pub async fn stop_batch(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<(), EngineError> {
        let running = self.registry.lock().await.remove(id);
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(err) = running.task.await {
                warn!(batch_id = %id, error = %err, "scheduler task join failed");
            }
        }

        let batch = self.store.get_batch(id).await?;
        if !batch.state.is_terminal() {
            self.store
                .update_batch(
                    id,
                    BatchPatch::to_state(BatchState::Cancelled).with_completed(Utc::now()),
                )
                .await?;
            info!(batch_id = %id, "batch cancelled");
        }
        self.tracker.stop_tracking(id).await;
        Ok(())
    }

    /// Stop the batch if running, discard its artifacts, and cascade-delete
    /// its records.
    pub async fn delete_batch(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(id).await;
        let _guard = lock.lock().await;

        self.stop_locked(id).await?;

        if let Err(err) = self.source.discard(id).await {
            warn!(batch_id = %id, error = %err, "failed to discard source artifact");
        }
        if let Err(err) = self.sink.discard(id).await {
            warn!(batch_id = %id, error = %err, "failed to discard result artifact");
        }

        self.store.delete_batch(id).await?;
        self.lifecycle.lock().await.remove(id);
        info!(batch_id = %id, "batch deleted");
        Ok(())
    }

    /// Reset one failed execution to pending and re-open the batch if it
    /// already finished.
    pub async fn retry_execution(
        &self,
        batch_id: &str,
        execution_id: &str,
    ) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(batch_id).await;
        let _guard = lock.lock().await;

        let batch = self.store.get_batch(batch_id).await?;
        if batch.state == BatchState::Cancelled {
            return Err(EngineError::InvalidStateTransition {
                from: BatchState::Cancelled.to_string(),
                to: BatchState::Running.to_string(),
            });
        }

        let execution = self.store.get_execution(execution_id).await?;
        if execution.batch_id != batch_id {
            return Err(EngineError::NotFound(format!(
                "execution {execution_id} in batch {batch_id}"
            )));
        }

        self.store
            .transition_execution(execution_id, ExecutionState::Failed, ExecutionPatch::reset())
            .await?;
        self.store
            .bump_batch_counter(batch_id, BatchCounter::Failed, -1)
            .await?;

        info!(batch_id = %batch_id, execution_id = %execution_id, "execution reset for retry");
        self.reopen_if_terminal(batch_id).await
    }

    /// Bulk-reset every failed execution of the batch and re-open it if it
    /// already finished. Returns the number of rows reset.
    pub async fn retry_all_failed(&self, batch_id: &str) -> Result<usize, EngineError> {
        let lock = self.lifecycle_lock(batch_id).await;
        let _guard = lock.lock().await;

        let batch = self.store.get_batch(batch_id).await?;
        if batch.state == BatchState::Cancelled {
            return Err(EngineError::InvalidStateTransition {
                from: BatchState::Cancelled.to_string(),
                to: BatchState::Running.to_string(),
            });
        }

        let reset = self.store.reset_failed_executions(batch_id).await?;
        if reset == 0 {
            info!(batch_id = %batch_id, "no failed executions to retry");
            return Ok(0);
        }

        info!(batch_id = %batch_id, reset, "failed executions reset for retry");
        self.reopen_if_terminal(batch_id).await?;
        Ok(reset)
    }

    /// Re-attach a scheduler to a batch left Running in the store, working
    /// the existing pending set. Recovery's entry point; a no-op when the
    /// batch is already registered.
    pub async fn resume_interrupted(&self, batch_id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(batch_id).await;
        let _guard = lock.lock().await;

        if self.registry.lock().await.contains_key(batch_id) {
            return Ok(());
        }

        let batch = self.store.get_batch(batch_id).await?;
        if batch.state != BatchState::Running {
            return Err(EngineError::InvalidStateTransition {
                from: batch.state.to_string(),
                to: BatchState::Running.to_string(),
            });
        }
        self.launch(batch).await
    }

    /// Finalize a recovered batch whose rows are all terminal: assemble the
    /// result artifact and complete it without spinning up a scheduler.
    pub async fn finalize_recovered(&self, batch_id: &str) -> Result<(), EngineError> {
        let lock = self.lifecycle_lock(batch_id).await;
        let _guard = lock.lock().await;

        let executions = self.store.find_executions(batch_id, None).await?;
        let results = row_results(&executions, self.formatter.as_ref());
        let result_ref = self.sink.assemble(batch_id, &results).await?;

        self.store
            .update_batch(
                batch_id,
                BatchPatch::to_state(BatchState::Completed)
                    .with_completed(Utc::now())
                    .with_result_ref(result_ref),
            )
            .await?;
        info!(batch_id = %batch_id, "recovered batch finalized");
        Ok(())
    }

    async fn reopen_if_terminal(&self, batch_id: &str) -> Result<(), EngineError> {
        let batch = self.store.get_batch(batch_id).await?;
        if !batch.state.is_terminal() {
            // A live scheduler re-reads the pending set and picks the reset
            // rows up on its own.
            return Ok(());
        }

        let batch = self
            .store
            .update_batch(batch_id, BatchPatch::to_state(BatchState::Running))
            .await?;
        info!(batch_id = %batch_id, "batch re-opened");
        self.launch(batch).await
    }

    async fn launch(&self, batch: Batch) -> Result<(), EngineError> {
        let invoker = self
            .invokers
            .invoker_for(&batch.workflow_ref)
            .await
            .map_err(|err| {
                EngineError::Internal(format!(
                    "failed to resolve workflow '{}': {err}",
                    batch.workflow_ref
                ))
            })?;

        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let scheduler = BatchScheduler::new(
            &batch,
            SchedulerDeps {
                store: self.store.clone(),
                invoker,
                sink: self.sink.clone(),
                formatter: self.formatter.clone(),
                backoff: self.backoff.clone(),
                metrics: self.metrics.clone(),
                cancel: cancel.clone(),
                pause: pause_rx,
                lifecycle: self.lifecycle_lock(&batch.id).await,
            },
        );

        // The task waits for its registry entry to exist before running, so
        // it cannot deregister itself first.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry.clone();
        let store = self.store.clone();
        let id = batch.id.clone();
        let task = tokio::spawn(async move {
            let _ = ready_rx.await;
            match scheduler.run().await {
                Ok(outcome) => {
                    info!(batch_id = %id, outcome = ?outcome, "scheduler finished");
                }
                Err(err) => {
                    error!(batch_id = %id, error = %err, "scheduler aborted");
                    let patch = BatchPatch::to_state(BatchState::Failed)
                        .with_completed(Utc::now())
                        .with_error(err.to_string());
                    if let Err(update_err) = store.update_batch(&id, patch).await {
                        error!(
                            batch_id = %id,
                            error = %update_err,
                            "failed to mark batch failed"
                        );
                    }
                }
            }

            // A retry may have re-launched the batch and replaced this
            // entry; deregister only if the entry is still ours.
            let mut registry = registry.lock().await;
            if registry
                .get(&id)
                .is_some_and(|running| running.generation == generation)
            {
                registry.remove(&id);
            }
        });

        self.registry.lock().await.insert(
            batch.id.clone(),
            RunningBatch {
                generation,
                cancel,
                pause_tx,
                task,
            },
        );
        let _ = ready_tx.send(());

        self.tracker.start_tracking(&batch.id).await;
        info!(batch_id = %batch.id, workflow_ref = %batch.workflow_ref, "scheduler launched");
        Ok(())
    }

    /// Cancel every running scheduler and wait for the tasks to settle.
    /// Batches stay Running in the store; recovery resumes them at next
    /// startup.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, RunningBatch)> =
            self.registry.lock().await.drain().collect();
        for (id, running) in drained {
            info!(batch_id = %id, "cancelling scheduler for shutdown");
            running.cancel.cancel();
            if let Err(err) = running.task.await {
                warn!(batch_id = %id, error = %err, "scheduler task join failed");
            }
        }
        self.tracker.stop_all().await;
    }

    pub async fn is_running(&self, batch_id: &str) -> bool {
        self.registry.lock().await.contains_key(batch_id)
    }

    pub async fn get_batch(&self, id: &str) -> Result<Batch, EngineError> {
        Ok(self.store.get_batch(id).await?)
    }

    pub async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: Page,
    ) -> Result<BatchPage, EngineError> {
        Ok(self.store.list_batches(filter, page).await?)
    }

    pub async fn get_executions(&self, batch_id: &str) -> Result<Vec<Execution>, EngineError> {
        self.store.get_batch(batch_id).await?;
        Ok(self.store.find_executions(batch_id, None).await?)
    }

    pub async fn get_failed_executions(
        &self,
        batch_id: &str,
    ) -> Result<Vec<Execution>, EngineError> {
        self.store.get_batch(batch_id).await?;
        Ok(self
            .store
            .find_executions(batch_id, Some(ExecutionState::Failed))
            .await?)
    }
}
