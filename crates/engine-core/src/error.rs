use model::batch::BatchState;
use model::execution::ExecutionState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("invalid state transition for batch {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: BatchState,
        to: BatchState,
    },

    #[error("execution {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: ExecutionState,
        actual: ExecutionState,
    },

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode record: {0}")]
    Decode(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Classification of an invocation error, deciding retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeErrorKind {
    /// Retryable: timeouts, network failures, remote overload.
    Transient,
    /// Not retryable: the remote rejected the request outright.
    Permanent,
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct InvokeError {
    pub kind: InvokeErrorKind,
    pub message: String,
}

impl InvokeError {
    pub fn transient(message: impl Into<String>) -> Self {
        InvokeError {
            kind: InvokeErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        InvokeError {
            kind: InvokeErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::transient(format!(
            "invocation timed out after {:.0}s",
            after.as_secs_f64()
        ))
    }

    pub fn is_transient(&self) -> bool {
        self.kind == InvokeErrorKind::Transient
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("row source I/O error: {0}")]
    Io(String),

    #[error("malformed row {row_index}: {message}")]
    MalformedRow { row_index: usize, message: String },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("result sink I/O error: {0}")]
    Io(String),
}
