use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct InnerMetrics {
    invocations: AtomicU64,
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    retries: AtomicU64,
}

/// Cheap shared counters for the engine's hot path.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub retries: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics::default()),
        }
    }

    pub fn incr_invocations(&self, count: u64) {
        self.inner.invocations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_rows_succeeded(&self, count: u64) {
        self.inner.rows_succeeded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_rows_failed(&self, count: u64) {
        self.inner.rows_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_retries(&self, count: u64) {
        self.inner.retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.inner.invocations.load(Ordering::Relaxed),
            rows_succeeded: self.inner.rows_succeeded.load(Ordering::Relaxed),
            rows_failed: self.inner.rows_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
