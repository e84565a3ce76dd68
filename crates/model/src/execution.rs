use crate::value::{InputMap, OutputMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// State of a single row's invocation attempt-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Success => "success",
            ExecutionState::Failed => "failed",
            ExecutionState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success | ExecutionState::Failed | ExecutionState::Skipped
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row's remote invocation record: the unit of retry and state tracking.
///
/// `(batch_id, row_index)` is unique within the store. `outputs` is present
/// exactly when the state is Success; `error_message` exactly when Failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub batch_id: String,
    /// Zero-based position of the row in the source artifact.
    pub row_index: usize,
    pub inputs: InputMap,
    pub outputs: Option<OutputMap>,
    pub state: ExecutionState,
    pub retries_used: u32,
    pub execution_time_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn new(batch_id: &str, row_index: usize, inputs: InputMap) -> Self {
        Execution {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            row_index,
            inputs,
            outputs: None,
            state: ExecutionState::Pending,
            retries_used: 0,
            execution_time_seconds: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
