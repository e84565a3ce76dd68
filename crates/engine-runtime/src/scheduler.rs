use chrono::Utc;
use engine_core::backoff::BackoffPolicy;
use engine_core::error::{InvokeError, SinkError, StoreError};
use engine_core::invoker::WorkflowInvoker;
use engine_core::metrics::Metrics;
use engine_core::rows::{OutputFormatter, ResultSink, RowOutcome, RowResult};
use engine_core::store::{BatchPatch, BatchStore, ExecutionPatch, ExecutionStats};
use model::batch::{Batch, BatchCounter, BatchState};
use model::execution::{Execution, ExecutionState};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("result sink error: {0}")]
    Sink(#[from] SinkError),
}

/// How a scheduler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Shared collaborators handed to a scheduler at construction.
pub struct SchedulerDeps {
    pub store: Arc<dyn BatchStore>,
    pub invoker: Arc<dyn WorkflowInvoker>,
    pub sink: Arc<dyn ResultSink>,
    pub formatter: Arc<dyn OutputFormatter>,
    pub backoff: BackoffPolicy,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
    /// The batch's lifecycle mutex, shared with the controller. Held while
    /// deciding the terminal state so a concurrent retry operation cannot
    /// reset rows between the last wave read and the terminal transition.
    pub lifecycle: Arc<Mutex<()>>,
}

/// Per-batch bounded-concurrency executor.
///
/// Work is drawn from the batch's Pending executions in row order; every
/// state transition flows through a conditional store write, so a row is
/// accounted exactly once even when a retry operation races the run.
pub struct BatchScheduler {
    batch_id: String,
    max_concurrency: usize,
    retry_count: u32,
    timeout_per_call: Duration,
    store: Arc<dyn BatchStore>,
    invoker: Arc<dyn WorkflowInvoker>,
    sink: Arc<dyn ResultSink>,
    formatter: Arc<dyn OutputFormatter>,
    backoff: BackoffPolicy,
    metrics: Metrics,
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
    lifecycle: Arc<Mutex<()>>,
}

impl BatchScheduler {
    pub fn new(batch: &Batch, deps: SchedulerDeps) -> Self {
        BatchScheduler {
            batch_id: batch.id.clone(),
            max_concurrency: batch.max_concurrency.max(1),
            retry_count: batch.retry_count,
            timeout_per_call: batch.timeout_per_call,
            store: deps.store,
            invoker: deps.invoker,
            sink: deps.sink,
            formatter: deps.formatter,
            backoff: deps.backoff,
            metrics: deps.metrics,
            cancel: deps.cancel,
            pause: deps.pause,
            lifecycle: deps.lifecycle,
        }
    }

    pub async fn run(mut self) -> Result<SchedulerOutcome, SchedulerError> {
        info!(
            batch_id = %self.batch_id,
            max_concurrency = self.max_concurrency,
            "scheduler starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        loop {
            self.drain(&semaphore).await?;

            if self.cancel.is_cancelled() {
                info!(batch_id = %self.batch_id, "scheduler cancelled");
                return Ok(SchedulerOutcome::Cancelled);
            }

            // The terminal decision is serialized against the retry
            // operations through the batch's lifecycle mutex: a retry that
            // resets rows after the last wave read either shows up as
            // pending here and sends us back to the drain, or observes the
            // terminal state and re-opens the batch itself. The lock wait
            // races the cancel signal because stop holds this mutex while
            // joining the scheduler task.
            let _guard = tokio::select! {
                guard = self.lifecycle.clone().lock_owned() => guard,
                _ = self.cancel.cancelled() => {
                    info!(batch_id = %self.batch_id, "scheduler cancelled");
                    return Ok(SchedulerOutcome::Cancelled);
                }
            };

            let stats = self.store.execution_stats(&self.batch_id).await?;
            if stats.pending > 0 {
                debug!(
                    batch_id = %self.batch_id,
                    pending = stats.pending,
                    "rows re-opened during finalization, resuming"
                );
                continue;
            }
            return self.finalize(stats).await;
        }
    }

    /// Claim and run pending rows in waves until none remain, the batch is
    /// cancelled, or the pause signal stops new claims.
    async fn drain(&mut self, semaphore: &Arc<Semaphore>) -> Result<(), SchedulerError> {
        let mut workers: JoinSet<()> = JoinSet::new();

        'drain: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let pending = self
                .store
                .find_executions(&self.batch_id, Some(ExecutionState::Pending))
                .await?;
            if pending.is_empty() {
                break;
            }
            debug!(batch_id = %self.batch_id, pending = pending.len(), "claiming wave");

            for execution in pending {
                // Pause is re-checked after the permit wait so a pause that
                // lands while a slot frees up still blocks the claim.
                let permit = 'claim: loop {
                    if !self.wait_while_resumable().await {
                        break 'drain;
                    }

                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break 'drain,
                        },
                        _ = self.cancel.cancelled() => break 'drain,
                    };

                    if *self.pause.borrow() {
                        drop(permit);
                        continue 'claim;
                    }
                    break 'claim permit;
                };

                let worker = Worker {
                    batch_id: self.batch_id.clone(),
                    retry_count: self.retry_count,
                    timeout_per_call: self.timeout_per_call,
                    store: self.store.clone(),
                    invoker: self.invoker.clone(),
                    backoff: self.backoff.clone(),
                    metrics: self.metrics.clone(),
                    cancel: self.cancel.clone(),
                };
                workers.spawn(async move {
                    let _permit = permit;
                    worker.run(execution).await;
                });
            }

            while workers.join_next().await.is_some() {}
        }

        while workers.join_next().await.is_some() {}
        Ok(())
    }

    /// Block while the batch is paused. Returns false when cancelled.
    async fn wait_while_resumable(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*self.pause.borrow() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.pause.changed() => {
                    // Sender gone means the controller dropped us; claiming
                    // stops at the next cancellation check.
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// Decide and record the terminal state. Called with the lifecycle
    /// mutex held and no pending rows.
    async fn finalize(&self, stats: ExecutionStats) -> Result<SchedulerOutcome, SchedulerError> {
        // A batch paused after its last row was claimed drains to
        // completion; re-enter Running so the terminal edge is legal.
        let batch = self.store.get_batch(&self.batch_id).await?;
        if batch.state == BatchState::Paused {
            self.store
                .update_batch(&self.batch_id, BatchPatch::to_state(BatchState::Running))
                .await?;
        }

        // Row-level failures do not fail the batch; a shortfall of terminal
        // rows does, since it means the run aborted mid-flight.
        let final_state = if stats.terminal() == stats.total {
            BatchState::Completed
        } else {
            BatchState::Failed
        };

        let executions = self.store.find_executions(&self.batch_id, None).await?;
        let results = row_results(&executions, self.formatter.as_ref());
        let result_ref = self.sink.assemble(&self.batch_id, &results).await?;

        self.store
            .update_batch(
                &self.batch_id,
                BatchPatch::to_state(final_state)
                    .with_completed(Utc::now())
                    .with_result_ref(result_ref),
            )
            .await?;

        info!(
            batch_id = %self.batch_id,
            state = %final_state,
            completed = stats.success,
            failed = stats.failed,
            "batch finished"
        );

        Ok(match final_state {
            BatchState::Completed => SchedulerOutcome::Completed,
            _ => SchedulerOutcome::Failed,
        })
    }
}

/// Render per-row results for the artifact, preserving row order.
pub(crate) fn row_results(
    executions: &[Execution],
    formatter: &dyn OutputFormatter,
) -> Vec<RowResult> {
    executions
        .iter()
        .map(|execution| RowResult {
            row_index: execution.row_index,
            outcome: match execution.state {
                ExecutionState::Success => RowOutcome::Success(
                    execution
                        .outputs
                        .as_ref()
                        .map(|outputs| formatter.render(outputs))
                        .unwrap_or_default(),
                ),
                ExecutionState::Failed => RowOutcome::Failure(
                    execution
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "execution failed".to_string()),
                ),
                ExecutionState::Skipped => RowOutcome::Failure("row skipped".to_string()),
                ExecutionState::Pending | ExecutionState::Running => {
                    RowOutcome::Failure("row did not complete".to_string())
                }
            },
        })
        .collect()
}

/// Runs one execution to a terminal state, driving its retry loop.
struct Worker {
    batch_id: String,
    retry_count: u32,
    timeout_per_call: Duration,
    store: Arc<dyn BatchStore>,
    invoker: Arc<dyn WorkflowInvoker>,
    backoff: BackoffPolicy,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, execution: Execution) {
        let execution_id = execution.id.clone();
        let inputs = execution.inputs;
        let mut retries_used = execution.retries_used;

        loop {
            // Claim the row. Losing the claim means another path (a
            // concurrent retry wave) owns it now.
            match self
                .store
                .transition_execution(
                    &execution_id,
                    ExecutionState::Pending,
                    ExecutionPatch::claimed(Utc::now()),
                )
                .await
            {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) => {
                    debug!(execution_id = %execution_id, "row claimed elsewhere, skipping");
                    return;
                }
                Err(err) => {
                    warn!(execution_id = %execution_id, error = %err, "claim failed");
                    return;
                }
            }

            self.metrics.incr_invocations(1);
            let started = Instant::now();

            let outcome = tokio::select! {
                result = timeout(self.timeout_per_call, self.invoker.invoke(&inputs)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(InvokeError::timed_out(self.timeout_per_call)),
                    }
                }
                _ = self.cancel.cancelled() => {
                    // Abandoned mid-invocation: the row stays Running and is
                    // normalized back to Pending by recovery at next start.
                    debug!(execution_id = %execution_id, "worker cancelled mid-invocation");
                    return;
                }
            };
            let elapsed = started.elapsed().as_secs_f64();

            match outcome {
                Ok(outputs) => {
                    self.settle(
                        &execution_id,
                        ExecutionPatch::succeeded(outputs, elapsed, Utc::now()),
                        BatchCounter::Completed,
                    )
                    .await;
                    self.metrics.incr_rows_succeeded(1);
                    return;
                }
                Err(err) if err.is_transient() && retries_used < self.retry_count => {
                    retries_used += 1;
                    self.metrics.incr_retries(1);

                    if let Err(release_err) = self
                        .store
                        .transition_execution(
                            &execution_id,
                            ExecutionState::Running,
                            ExecutionPatch::released(retries_used),
                        )
                        .await
                    {
                        warn!(
                            execution_id = %execution_id,
                            error = %release_err,
                            "failed to release row for retry"
                        );
                        return;
                    }

                    let delay = self.backoff.delay_for(retries_used);
                    warn!(
                        execution_id = %execution_id,
                        retries_used,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        // Cancelled during backoff: the row is already
                        // Pending, so it resumes cleanly later.
                        _ = self.cancel.cancelled() => return,
                    }
                }
                Err(err) => {
                    self.settle(
                        &execution_id,
                        ExecutionPatch::failed(err.message.clone(), elapsed, Utc::now()),
                        BatchCounter::Failed,
                    )
                    .await;
                    self.metrics.incr_rows_failed(1);
                    return;
                }
            }
        }
    }

    /// Record a terminal outcome and bump the matching batch counter. The
    /// counter is only bumped when the conditional transition won, which is
    /// what keeps accounting at-most-once.
    async fn settle(&self, execution_id: &str, patch: ExecutionPatch, counter: BatchCounter) {
        match self
            .store
            .transition_execution(execution_id, ExecutionState::Running, patch)
            .await
        {
            Ok(_) => {
                if let Err(err) = self
                    .store
                    .bump_batch_counter(&self.batch_id, counter, 1)
                    .await
                {
                    warn!(
                        execution_id = %execution_id,
                        error = %err,
                        "failed to bump batch counter"
                    );
                }
            }
            Err(err) => {
                warn!(
                    execution_id = %execution_id,
                    error = %err,
                    "failed to record row outcome"
                );
            }
        }
    }
}
