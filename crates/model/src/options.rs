use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("batch name must not be empty")]
    EmptyName,

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("timeout_per_call must be greater than zero")]
    ZeroTimeout,
}

/// Runtime options for a batch. Defaults mirror the service defaults:
/// three workers, two retries, five-minute per-call timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub name: String,
    pub max_concurrency: usize,
    pub retry_count: u32,
    pub timeout_per_call: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            name: String::new(),
            max_concurrency: 3,
            retry_count: 2,
            timeout_per_call: Duration::from_secs(300),
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.name.trim().is_empty() {
            return Err(OptionsError::EmptyName);
        }
        if self.max_concurrency == 0 {
            return Err(OptionsError::ZeroConcurrency);
        }
        if self.timeout_per_call.is_zero() {
            return Err(OptionsError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Everything needed to create a batch: which workflow to invoke, where the
/// rows come from, and how to run them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub workflow_ref: String,
    pub source_ref: String,
    pub options: BatchOptions,
}

impl BatchDescriptor {
    pub fn new(workflow_ref: &str, source_ref: &str, options: BatchOptions) -> Self {
        BatchDescriptor {
            workflow_ref: workflow_ref.to_string(),
            source_ref: source_ref.to_string(),
            options,
        }
    }
}
