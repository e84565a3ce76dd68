use crate::options::BatchOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Running => "running",
            BatchState::Paused => "paused",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::Cancelled
        )
    }

    /// Whether a transition from `self` to `to` is allowed.
    ///
    /// Completed and Failed may re-enter Running: that is the retry-failed
    /// path re-opening a finished batch. Cancelled is final.
    pub fn can_transition_to(self, to: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Completed, Running)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BatchState::Pending),
            "running" => Ok(BatchState::Running),
            "paused" => Ok(BatchState::Paused),
            "completed" => Ok(BatchState::Completed),
            "failed" => Ok(BatchState::Failed),
            "cancelled" => Ok(BatchState::Cancelled),
            other => Err(format!("unknown batch state: {other}")),
        }
    }
}

/// The per-batch counters maintained by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCounter {
    Completed,
    Failed,
    Skipped,
}

/// A user-submitted unit of work: a row set, a workflow reference, and the
/// runtime options the scheduler honors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    /// Reference to the remote workflow this batch invokes.
    pub workflow_ref: String,
    /// Reference to the uploaded source artifact the rows came from.
    pub source_ref: String,
    /// Reference to the assembled result artifact, set at finalization.
    pub result_ref: Option<String>,
    pub max_concurrency: usize,
    pub retry_count: u32,
    pub timeout_per_call: Duration,
    pub state: BatchState,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Batch {
    pub fn new(workflow_ref: &str, source_ref: &str, options: &BatchOptions) -> Self {
        Batch {
            id: Uuid::new_v4().to_string(),
            name: options.name.clone(),
            workflow_ref: workflow_ref.to_string(),
            source_ref: source_ref.to_string(),
            result_ref: None,
            max_concurrency: options.max_concurrency,
            retry_count: options.retry_count,
            timeout_per_call: options.timeout_per_call,
            state: BatchState::Pending,
            total: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of rows that have reached a terminal state.
    pub fn terminal_rows(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }
}
