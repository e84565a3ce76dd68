use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::batch::{Batch, BatchCounter, BatchState};
use model::execution::{Execution, ExecutionState};
use model::value::{InputMap, OutputMap};

pub mod sled_store;

/// Filter for batch listings.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub state: Option<BatchState>,
    pub workflow_ref: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: usize,
    pub size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Page { page: 1, size: 20 }
    }
}

impl Page {
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.size
    }
}

#[derive(Debug, Clone)]
pub struct BatchPage {
    pub batches: Vec<Batch>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl BatchPage {
    pub fn pages(&self) -> usize {
        if self.total == 0 || self.size == 0 {
            0
        } else {
            self.total.div_ceil(self.size)
        }
    }
}

/// Recomputed counter set, written during recovery reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Partial update for a batch record. A state change is validated against
/// the allowed-transition table inside the store transaction.
#[derive(Debug, Clone, Default)]
pub struct BatchPatch {
    pub state: Option<BatchState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub counters: Option<BatchCounters>,
}

impl BatchPatch {
    pub fn to_state(state: BatchState) -> Self {
        BatchPatch {
            state: Some(state),
            ..BatchPatch::default()
        }
    }

    pub fn with_started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    pub fn with_counters(mut self, counters: BatchCounters) -> Self {
        self.counters = Some(counters);
        self
    }
}

/// Conditional update for an execution record, applied only when the stored
/// state matches the expected `from` state. Prevents double accounting when
/// the scheduler and a retry operation race on the same row.
#[derive(Debug, Clone)]
pub struct ExecutionPatch {
    pub state: ExecutionState,
    pub outputs: Option<OutputMap>,
    pub error_message: Option<String>,
    pub retries_used: Option<u32>,
    pub execution_time_seconds: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wipe outputs, error, stamps, timing, and the retry budget before
    /// applying the fields above. Used by the retry reset.
    pub clear: bool,
}

impl ExecutionPatch {
    fn base(state: ExecutionState) -> Self {
        ExecutionPatch {
            state,
            outputs: None,
            error_message: None,
            retries_used: None,
            execution_time_seconds: None,
            started_at: None,
            completed_at: None,
            clear: false,
        }
    }

    /// Pending -> Running, stamping the start time.
    pub fn claimed(at: DateTime<Utc>) -> Self {
        ExecutionPatch {
            started_at: Some(at),
            ..Self::base(ExecutionState::Running)
        }
    }

    /// Running -> Success with outputs and timing.
    pub fn succeeded(outputs: OutputMap, seconds: f64, at: DateTime<Utc>) -> Self {
        ExecutionPatch {
            outputs: Some(outputs),
            execution_time_seconds: Some(seconds),
            completed_at: Some(at),
            ..Self::base(ExecutionState::Success)
        }
    }

    /// Running -> Failed with the error and timing.
    pub fn failed(message: impl Into<String>, seconds: f64, at: DateTime<Utc>) -> Self {
        ExecutionPatch {
            error_message: Some(message.into()),
            execution_time_seconds: Some(seconds),
            completed_at: Some(at),
            ..Self::base(ExecutionState::Failed)
        }
    }

    /// Running -> Pending after a transient failure, recording the burned
    /// retry so the budget survives restarts.
    pub fn released(retries_used: u32) -> Self {
        ExecutionPatch {
            retries_used: Some(retries_used),
            ..Self::base(ExecutionState::Pending)
        }
    }

    /// Failed -> Pending with a fresh retry budget; the retry operation.
    pub fn reset() -> Self {
        ExecutionPatch {
            clear: true,
            ..Self::base(ExecutionState::Pending)
        }
    }
}

/// Counts of a batch's executions by state, plus the mean execution time
/// over successful rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub avg_execution_time: Option<f64>,
}

impl ExecutionStats {
    pub fn terminal(&self) -> u64 {
        self.success + self.failed + self.skipped
    }
}

/// Durable entity store for batches and executions.
///
/// The store is the only shared mutable resource in the engine; every
/// mutation goes through one of these operations, each of which is atomic.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    async fn get_batch(&self, id: &str) -> Result<Batch, StoreError>;

    async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: Page,
    ) -> Result<BatchPage, StoreError>;

    /// Read-modify-write under a transaction; state changes are checked
    /// against the allowed-transition table. Returns the updated batch.
    async fn update_batch(&self, id: &str, patch: BatchPatch) -> Result<Batch, StoreError>;

    /// Delete the batch and cascade to its executions.
    async fn delete_batch(&self, id: &str) -> Result<(), StoreError>;

    /// Persist one pending execution per row in a single transaction and
    /// set the batch's `total` to the row count.
    async fn create_executions(
        &self,
        batch_id: &str,
        rows: &[(usize, InputMap)],
    ) -> Result<usize, StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Execution, StoreError>;

    /// Executions of a batch, ordered by row index, optionally filtered by
    /// state.
    async fn find_executions(
        &self,
        batch_id: &str,
        state: Option<ExecutionState>,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Conditional write: fails with `Conflict` unless the stored state
    /// equals `from`. Returns the updated execution.
    async fn transition_execution(
        &self,
        id: &str,
        from: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError>;

    /// Atomically add `delta` to a batch counter, saturating at zero.
    async fn bump_batch_counter(
        &self,
        batch_id: &str,
        counter: BatchCounter,
        delta: i64,
    ) -> Result<(), StoreError>;

    async fn execution_stats(&self, batch_id: &str) -> Result<ExecutionStats, StoreError>;

    /// Recovery normalization: move every Running execution back to
    /// Pending, clearing its start stamp and timing. Returns the number of
    /// rows normalized.
    async fn reset_running_executions(&self, batch_id: &str) -> Result<usize, StoreError>;

    /// Bulk retry: reset every Failed execution to Pending (clearing
    /// outputs, error, stamps, timing, and retry budget) and zero the
    /// batch's failed counter in the same transaction. Returns the number
    /// of rows reset.
    async fn reset_failed_executions(&self, batch_id: &str) -> Result<usize, StoreError>;
}
