use engine_core::error::StoreError;
use engine_runtime::error::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize data to JSON: {0}")]
    JsonSerialize(serde_json::Error),

    #[error("invalid batch state filter: {0}")]
    InvalidStateFilter(String),

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("unexpected error: {0}")]
    Unexpected(String),
}
