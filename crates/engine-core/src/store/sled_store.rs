use crate::error::StoreError;
use crate::store::{
    BatchFilter, BatchPage, BatchPatch, BatchStore, ExecutionPatch, ExecutionStats, Page,
};
use async_trait::async_trait;
use model::batch::{Batch, BatchCounter};
use model::execution::{Execution, ExecutionState};
use model::value::InputMap;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;
use tracing::debug;

/// Sled-backed batch store.
///
/// Key scheme (single tree):
///   batch:{batch_id}              -> Batch
///   exec:{batch_id}:{row_index}   -> Execution   (row index zero-padded so
///                                                 key order is row order)
///   exid:{execution_id}           -> exec key    (secondary index)
pub struct SledBatchStore {
    db: sled::Db,
}

type TxError = ConflictableTransactionError<StoreError>;

fn abort(err: StoreError) -> TxError {
    ConflictableTransactionError::Abort(err)
}

impl SledBatchStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        debug!(path = %path.as_ref().display(), "batch store opened");
        Ok(SledBatchStore { db })
    }

    #[inline]
    fn batch_key(id: &str) -> String {
        format!("batch:{id}")
    }

    #[inline]
    fn exec_key(batch_id: &str, row_index: usize) -> String {
        format!("exec:{batch_id}:{row_index:010}")
    }

    #[inline]
    fn exec_prefix(batch_id: &str) -> String {
        format!("exec:{batch_id}:")
    }

    #[inline]
    fn index_key(execution_id: &str) -> String {
        format!("exid:{execution_id}")
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(value).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode_batch(bytes: &[u8]) -> Result<Batch, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn decode_execution(bytes: &[u8]) -> Result<Execution, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn apply_execution_patch(execution: &mut Execution, patch: &ExecutionPatch) {
        if patch.clear {
            execution.outputs = None;
            execution.error_message = None;
            execution.started_at = None;
            execution.completed_at = None;
            execution.execution_time_seconds = None;
            execution.retries_used = 0;
        }
        execution.state = patch.state;
        if let Some(outputs) = &patch.outputs {
            execution.outputs = Some(outputs.clone());
        }
        if let Some(message) = &patch.error_message {
            execution.error_message = Some(message.clone());
        }
        if let Some(retries) = patch.retries_used {
            execution.retries_used = retries;
        }
        if let Some(seconds) = patch.execution_time_seconds {
            execution.execution_time_seconds = Some(seconds);
        }
        if let Some(at) = patch.started_at {
            execution.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            execution.completed_at = Some(at);
        }
    }

    /// Collect the keys of a batch's executions, optionally filtered by
    /// state. Used to pin down the key set before a bulk transaction.
    fn execution_keys(
        &self,
        batch_id: &str,
        state: Option<ExecutionState>,
    ) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(Self::exec_prefix(batch_id)) {
            let (key, value) = item?;
            let execution = Self::decode_execution(&value)?;
            if state.is_none() || state == Some(execution.state) {
                keys.push(String::from_utf8_lossy(&key).to_string());
            }
        }
        Ok(keys)
    }

    fn unwrap_tx<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(StoreError::from(err)),
        }
    }
}

#[async_trait]
impl BatchStore for SledBatchStore {
    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let bytes = Self::encode(batch)?;
        self.db.insert(Self::batch_key(&batch.id), bytes)?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Batch, StoreError> {
        match self.db.get(Self::batch_key(id))? {
            Some(bytes) => Self::decode_batch(&bytes),
            None => Err(StoreError::BatchNotFound(id.to_string())),
        }
    }

    async fn list_batches(
        &self,
        filter: &BatchFilter,
        page: Page,
    ) -> Result<BatchPage, StoreError> {
        let mut batches = Vec::new();
        for item in self.db.scan_prefix("batch:") {
            let (_key, value) = item?;
            let batch = Self::decode_batch(&value)?;

            if let Some(state) = filter.state
                && batch.state != state
            {
                continue;
            }
            if let Some(workflow_ref) = &filter.workflow_ref
                && batch.workflow_ref != *workflow_ref
            {
                continue;
            }
            batches.push(batch);
        }

        // Newest first; id as a tiebreak for a stable order.
        batches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = batches.len();
        let batches = batches
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .collect();

        Ok(BatchPage {
            batches,
            total,
            page: page.page,
            size: page.size,
        })
    }

    async fn update_batch(&self, id: &str, patch: BatchPatch) -> Result<Batch, StoreError> {
        let key = Self::batch_key(id);
        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let bytes = tx
                .get(key.as_str())?
                .ok_or_else(|| abort(StoreError::BatchNotFound(id.to_string())))?;
            let mut batch = Self::decode_batch(&bytes).map_err(abort)?;

            if let Some(to) = patch.state {
                if batch.state != to && !batch.state.can_transition_to(to) {
                    return Err(abort(StoreError::InvalidTransition {
                        id: id.to_string(),
                        from: batch.state,
                        to,
                    }));
                }
                batch.state = to;
            }
            if let Some(at) = patch.started_at {
                batch.started_at = Some(at);
            }
            if let Some(at) = patch.completed_at {
                batch.completed_at = Some(at);
            }
            if let Some(message) = &patch.error_message {
                batch.error_message = Some(message.clone());
            }
            if let Some(result_ref) = &patch.result_ref {
                batch.result_ref = Some(result_ref.clone());
            }
            if let Some(counters) = patch.counters {
                batch.total = counters.total;
                batch.completed = counters.completed;
                batch.failed = counters.failed;
                batch.skipped = counters.skipped;
            }

            let bytes = Self::encode(&batch).map_err(abort)?;
            tx.insert(key.as_str(), bytes)?;
            Ok(batch)
        });
        Self::unwrap_tx(result)
    }

    async fn delete_batch(&self, id: &str) -> Result<(), StoreError> {
        // Existence check, and pins down the cascade key set.
        self.get_batch(id).await?;

        let mut cascade = Vec::new();
        for item in self.db.scan_prefix(Self::exec_prefix(id)) {
            let (key, value) = item?;
            let execution = Self::decode_execution(&value)?;
            cascade.push((
                String::from_utf8_lossy(&key).to_string(),
                Self::index_key(&execution.id),
            ));
        }

        let batch_key = Self::batch_key(id);
        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            tx.remove(batch_key.as_str())?;
            for (exec_key, index_key) in &cascade {
                tx.remove(exec_key.as_str())?;
                tx.remove(index_key.as_str())?;
            }
            Ok(())
        });
        Self::unwrap_tx(result)
    }

    async fn create_executions(
        &self,
        batch_id: &str,
        rows: &[(usize, InputMap)],
    ) -> Result<usize, StoreError> {
        let mut records = Vec::with_capacity(rows.len());
        for (row_index, inputs) in rows {
            let execution = Execution::new(batch_id, *row_index, inputs.clone());
            records.push((
                Self::exec_key(batch_id, *row_index),
                Self::encode(&execution)?,
                Self::index_key(&execution.id),
            ));
        }

        let batch_key = Self::batch_key(batch_id);
        let count = rows.len();
        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let bytes = tx
                .get(batch_key.as_str())?
                .ok_or_else(|| abort(StoreError::BatchNotFound(batch_id.to_string())))?;
            let mut batch = Self::decode_batch(&bytes).map_err(abort)?;
            batch.total = count as u64;
            let bytes = Self::encode(&batch).map_err(abort)?;
            tx.insert(batch_key.as_str(), bytes)?;

            for (exec_key, exec_bytes, index_key) in &records {
                tx.insert(exec_key.as_str(), exec_bytes.as_slice())?;
                tx.insert(index_key.as_str(), exec_key.as_bytes())?;
            }
            Ok(())
        });
        Self::unwrap_tx(result)?;
        Ok(count)
    }

    async fn get_execution(&self, id: &str) -> Result<Execution, StoreError> {
        let key = self
            .db
            .get(Self::index_key(id))?
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;
        let bytes = self
            .db
            .get(&key)?
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;
        Self::decode_execution(&bytes)
    }

    async fn find_executions(
        &self,
        batch_id: &str,
        state: Option<ExecutionState>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut executions = Vec::new();
        for item in self.db.scan_prefix(Self::exec_prefix(batch_id)) {
            let (_key, value) = item?;
            let execution = Self::decode_execution(&value)?;
            if state.is_none() || state == Some(execution.state) {
                executions.push(execution);
            }
        }
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        id: &str,
        from: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError> {
        let index_key = Self::index_key(id);
        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let exec_key = tx
                .get(index_key.as_str())?
                .ok_or_else(|| abort(StoreError::ExecutionNotFound(id.to_string())))?;
            let bytes = tx
                .get(&exec_key)?
                .ok_or_else(|| abort(StoreError::ExecutionNotFound(id.to_string())))?;
            let mut execution = Self::decode_execution(&bytes).map_err(abort)?;

            if execution.state != from {
                return Err(abort(StoreError::Conflict {
                    id: id.to_string(),
                    expected: from,
                    actual: execution.state,
                }));
            }

            Self::apply_execution_patch(&mut execution, &patch);
            let bytes = Self::encode(&execution).map_err(abort)?;
            tx.insert(exec_key, bytes)?;
            Ok(execution)
        });
        Self::unwrap_tx(result)
    }

    async fn bump_batch_counter(
        &self,
        batch_id: &str,
        counter: BatchCounter,
        delta: i64,
    ) -> Result<(), StoreError> {
        let key = Self::batch_key(batch_id);
        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let bytes = tx
                .get(key.as_str())?
                .ok_or_else(|| abort(StoreError::BatchNotFound(batch_id.to_string())))?;
            let mut batch = Self::decode_batch(&bytes).map_err(abort)?;

            let slot = match counter {
                BatchCounter::Completed => &mut batch.completed,
                BatchCounter::Failed => &mut batch.failed,
                BatchCounter::Skipped => &mut batch.skipped,
            };
            *slot = (*slot as i64 + delta).max(0) as u64;

            let bytes = Self::encode(&batch).map_err(abort)?;
            tx.insert(key.as_str(), bytes)?;
            Ok(())
        });
        Self::unwrap_tx(result)
    }

    async fn execution_stats(&self, batch_id: &str) -> Result<ExecutionStats, StoreError> {
        let mut stats = ExecutionStats::default();
        let mut time_sum = 0.0;
        let mut timed = 0u64;

        for item in self.db.scan_prefix(Self::exec_prefix(batch_id)) {
            let (_key, value) = item?;
            let execution = Self::decode_execution(&value)?;
            stats.total += 1;
            match execution.state {
                ExecutionState::Pending => stats.pending += 1,
                ExecutionState::Running => stats.running += 1,
                ExecutionState::Success => {
                    stats.success += 1;
                    if let Some(seconds) = execution.execution_time_seconds {
                        time_sum += seconds;
                        timed += 1;
                    }
                }
                ExecutionState::Failed => stats.failed += 1,
                ExecutionState::Skipped => stats.skipped += 1,
            }
        }

        if timed > 0 {
            stats.avg_execution_time = Some(time_sum / timed as f64);
        }
        Ok(stats)
    }

    async fn reset_running_executions(&self, batch_id: &str) -> Result<usize, StoreError> {
        let keys = self.execution_keys(batch_id, Some(ExecutionState::Running))?;
        if keys.is_empty() {
            return Ok(0);
        }

        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let mut reset = 0usize;
            for key in &keys {
                let Some(bytes) = tx.get(key.as_str())? else {
                    continue;
                };
                let mut execution = Self::decode_execution(&bytes).map_err(abort)?;
                if execution.state != ExecutionState::Running {
                    continue;
                }
                execution.state = ExecutionState::Pending;
                execution.started_at = None;
                execution.execution_time_seconds = None;
                let bytes = Self::encode(&execution).map_err(abort)?;
                tx.insert(key.as_str(), bytes)?;
                reset += 1;
            }
            Ok(reset)
        });
        Self::unwrap_tx(result)
    }

    async fn reset_failed_executions(&self, batch_id: &str) -> Result<usize, StoreError> {
        let keys = self.execution_keys(batch_id, Some(ExecutionState::Failed))?;
        let batch_key = Self::batch_key(batch_id);

        let result = self.db.transaction::<_, _, StoreError>(|tx| {
            let mut reset = 0usize;
            for key in &keys {
                let Some(bytes) = tx.get(key.as_str())? else {
                    continue;
                };
                let mut execution = Self::decode_execution(&bytes).map_err(abort)?;
                if execution.state != ExecutionState::Failed {
                    continue;
                }
                Self::apply_execution_patch(&mut execution, &ExecutionPatch::reset());
                let bytes = Self::encode(&execution).map_err(abort)?;
                tx.insert(key.as_str(), bytes)?;
                reset += 1;
            }

            let bytes = tx
                .get(batch_key.as_str())?
                .ok_or_else(|| abort(StoreError::BatchNotFound(batch_id.to_string())))?;
            let mut batch = Self::decode_batch(&bytes).map_err(abort)?;
            batch.failed = 0;
            let bytes = Self::encode(&batch).map_err(abort)?;
            tx.insert(batch_key.as_str(), bytes)?;

            Ok(reset)
        });
        Self::unwrap_tx(result)
    }
}
