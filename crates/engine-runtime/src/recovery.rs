use crate::controller::BatchController;
use crate::error::EngineError;
use chrono::Utc;
use engine_core::store::{BatchCounters, BatchFilter, BatchPatch, BatchStore, Page};
use model::batch::{Batch, BatchState};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened to each batch found mid-flight.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub found: usize,
    pub resumed: Vec<String>,
    pub finalized: Vec<String>,
    pub failed: Vec<String>,
}

enum Recovered {
    Resumed,
    Finalized,
}

/// Startup pass over batches the previous process left Running: normalize
/// executions orphaned mid-invocation, finalize batches whose rows all
/// finished, and hand the rest back to the controller to resume. Runs
/// before the controller accepts new work; a second pass over the same
/// store state is a no-op.
pub async fn recover(
    store: &Arc<dyn BatchStore>,
    controller: &BatchController,
) -> Result<RecoveryReport, EngineError> {
    let mut report = RecoveryReport::default();

    let interrupted = find_interrupted(store).await?;
    if interrupted.is_empty() {
        info!("no interrupted batches found");
        return Ok(report);
    }
    info!(count = interrupted.len(), "recovering interrupted batches");

    for batch in interrupted {
        report.found += 1;
        match recover_one(store, controller, &batch).await {
            Ok(Recovered::Resumed) => {
                info!(batch_id = %batch.id, "batch resumed");
                report.resumed.push(batch.id);
            }
            Ok(Recovered::Finalized) => {
                info!(batch_id = %batch.id, "batch finalized");
                report.finalized.push(batch.id);
            }
            Err(err) => {
                error!(batch_id = %batch.id, error = %err, "recovery failed");
                let patch = BatchPatch::to_state(BatchState::Failed)
                    .with_completed(Utc::now())
                    .with_error(format!("recovery failed: {err}"));
                if let Err(update_err) = store.update_batch(&batch.id, patch).await {
                    warn!(
                        batch_id = %batch.id,
                        error = %update_err,
                        "failed to mark unrecoverable batch"
                    );
                }
                report.failed.push(batch.id);
            }
        }
    }

    info!(
        found = report.found,
        resumed = report.resumed.len(),
        finalized = report.finalized.len(),
        failed = report.failed.len(),
        "recovery finished"
    );
    Ok(report)
}

async fn find_interrupted(store: &Arc<dyn BatchStore>) -> Result<Vec<Batch>, EngineError> {
    let filter = BatchFilter {
        state: Some(BatchState::Running),
        ..BatchFilter::default()
    };

    // Collect every page up front; recovery mutates states as it goes.
    let mut batches = Vec::new();
    let mut page = 1;
    loop {
        let listing = store
            .list_batches(&filter, Page { page, size: 100 })
            .await?;
        let fetched = listing.batches.len();
        batches.extend(listing.batches);
        if fetched < 100 {
            break;
        }
        page += 1;
    }
    Ok(batches)
}

async fn recover_one(
    store: &Arc<dyn BatchStore>,
    controller: &BatchController,
    batch: &Batch,
) -> Result<Recovered, EngineError> {
    // Rows that were in flight when the process died are still Running on
    // disk; they go back to Pending so the scheduler can claim them again.
    let normalized = store.reset_running_executions(&batch.id).await?;
    if normalized > 0 {
        info!(
            batch_id = %batch.id,
            normalized,
            "orphaned executions reset to pending"
        );
    }

    // The persisted counters may be behind the executions; rebuild them.
    let stats = store.execution_stats(&batch.id).await?;
    store
        .update_batch(
            &batch.id,
            BatchPatch::default().with_counters(BatchCounters {
                total: stats.total,
                completed: stats.success,
                failed: stats.failed,
                skipped: stats.skipped,
            }),
        )
        .await?;

    if stats.pending == 0 {
        controller.finalize_recovered(&batch.id).await?;
        Ok(Recovered::Finalized)
    } else {
        controller.resume_interrupted(&batch.id).await?;
        Ok(Recovered::Resumed)
    }
}
