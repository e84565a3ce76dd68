use engine_core::error::{SinkError, SourceError, StoreError};
use model::options::OptionsError;
use thiserror::Error;

/// Errors surfaced to callers of the control interface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BatchNotFound(id) => EngineError::NotFound(format!("batch {id}")),
            StoreError::ExecutionNotFound(id) => {
                EngineError::NotFound(format!("execution {id}"))
            }
            StoreError::InvalidTransition { from, to, .. } => {
                EngineError::InvalidStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            StoreError::Conflict {
                expected, actual, ..
            } => EngineError::InvalidStateTransition {
                from: actual.to_string(),
                to: expected.to_string(),
            },
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<OptionsError> for EngineError {
    fn from(err: OptionsError) -> Self {
        EngineError::ValidationFailed(err.to_string())
    }
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        EngineError::Internal(err.to_string())
    }
}
