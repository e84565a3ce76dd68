use chrono::{DateTime, Utc};
use engine_core::error::StoreError;
use engine_core::store::BatchStore;
use model::batch::BatchState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Live view of one batch's progress, rebuilt from the store each poll.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub batch_id: String,
    pub state: BatchState,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub running: u64,
    pub pending: u64,
    pub progress_percentage: f64,
    pub average_execution_time: Option<f64>,
    pub estimated_remaining_seconds: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Periodically aggregates store counters into cached snapshots, one poll
/// loop per tracked batch. Tracking stops on its own once the batch reaches
/// a terminal state.
pub struct ProgressTracker {
    store: Arc<dyn BatchStore>,
    interval: Duration,
    cache: Arc<RwLock<HashMap<String, ProgressSnapshot>>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<ProgressSnapshot>>>>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn BatchStore>, interval: Duration) -> Self {
        ProgressTracker {
            store,
            interval,
            cache: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start_tracking(&self, batch_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(batch_id) {
            debug!(batch_id = %batch_id, "already tracking");
            return;
        }

        let store = self.store.clone();
        let interval = self.interval;
        let cache = self.cache.clone();
        let subscribers = self.subscribers.clone();
        let task_map = self.tasks.clone();
        let id = batch_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let snapshot = match compute_snapshot(store.as_ref(), &id).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!(batch_id = %id, error = %err, "progress poll failed");
                        break;
                    }
                };
                let state = snapshot.state;

                cache.write().await.insert(id.clone(), snapshot.clone());
                notify(&subscribers, &id, snapshot).await;

                if state.is_terminal() {
                    info!(batch_id = %id, "batch finished, tracking stopped");
                    break;
                }
                sleep(interval).await;
            }
            task_map.lock().await.remove(&id);
        });

        tasks.insert(batch_id.to_string(), handle);
        info!(batch_id = %batch_id, "progress tracking started");
    }

    pub async fn stop_tracking(&self, batch_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(batch_id) {
            handle.abort();
        }
        self.cache.write().await.remove(batch_id);
        self.subscribers.write().await.remove(batch_id);
    }

    pub async fn stop_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        self.cache.write().await.clear();
        self.subscribers.write().await.clear();
    }

    /// Last cached snapshot, if the batch is (or was recently) tracked.
    pub async fn get_progress(&self, batch_id: &str) -> Option<ProgressSnapshot> {
        self.cache.read().await.get(batch_id).cloned()
    }

    /// Compute a snapshot directly from the store, bypassing the cache.
    pub async fn snapshot_now(&self, batch_id: &str) -> Result<ProgressSnapshot, StoreError> {
        compute_snapshot(self.store.as_ref(), batch_id).await
    }

    /// Receive every snapshot produced for the batch from now on.
    pub async fn subscribe(&self, batch_id: &str) -> mpsc::Receiver<ProgressSnapshot> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .write()
            .await
            .entry(batch_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn is_tracking(&self, batch_id: &str) -> bool {
        self.tasks.lock().await.contains_key(batch_id)
    }
}

async fn notify(
    subscribers: &RwLock<HashMap<String, Vec<mpsc::Sender<ProgressSnapshot>>>>,
    batch_id: &str,
    snapshot: ProgressSnapshot,
) {
    let mut subscribers = subscribers.write().await;
    if let Some(senders) = subscribers.get_mut(batch_id) {
        // Slow or dropped receivers are pruned rather than awaited.
        senders.retain(|sender| match sender.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

async fn compute_snapshot(
    store: &dyn BatchStore,
    batch_id: &str,
) -> Result<ProgressSnapshot, StoreError> {
    let batch = store.get_batch(batch_id).await?;
    let stats = store.execution_stats(batch_id).await?;

    let finished = stats.success + stats.failed;
    let progress_percentage = if stats.total > 0 {
        (finished as f64 / stats.total as f64) * 100.0
    } else {
        0.0
    };

    let estimated_remaining_seconds = match (stats.avg_execution_time, stats.pending) {
        (Some(avg), pending) if pending > 0 => {
            let waves = pending.div_ceil(batch.max_concurrency.max(1) as u64);
            Some((waves as f64 * avg).ceil() as u64)
        }
        _ => None,
    };

    Ok(ProgressSnapshot {
        batch_id: batch_id.to_string(),
        state: batch.state,
        total: stats.total,
        completed: stats.success,
        failed: stats.failed,
        skipped: stats.skipped,
        running: stats.running,
        pending: stats.pending,
        progress_percentage,
        average_execution_time: stats.avg_execution_time,
        estimated_remaining_seconds,
        started_at: batch.started_at,
    })
}
