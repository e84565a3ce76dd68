use crate::error::{SinkError, SourceError};
use async_trait::async_trait;
use model::value::{InputMap, OutputMap};

/// Outcome of one row, rendered for the result artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// The workflow's outputs, rendered to a single display value.
    Success(String),
    /// A readable error string.
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    pub row_index: usize,
    pub outcome: RowOutcome,
}

/// Enumerates a batch's input rows by ascending row index.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn rows(&self, batch_id: &str) -> Result<Vec<(usize, InputMap)>, SourceError>;

    /// Remove the source artifact backing the batch, if any.
    async fn discard(&self, batch_id: &str) -> Result<(), SourceError>;
}

/// Materializes the downloadable per-row result artifact.
///
/// Row `i` of the artifact corresponds to the source row with
/// `row_index = i`, regardless of completion order.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Write the artifact and return a reference to it.
    async fn assemble(&self, batch_id: &str, results: &[RowResult]) -> Result<String, SinkError>;

    /// Remove the result artifact for the batch, if any.
    async fn discard(&self, batch_id: &str) -> Result<(), SinkError>;
}

/// Renders a workflow's output map to the single display value carried in
/// the result artifact. Pluggable so deployments can match their workflow's
/// output shape instead of relying on field-name heuristics.
pub trait OutputFormatter: Send + Sync {
    fn render(&self, outputs: &OutputMap) -> String;
}

/// Default formatter: joins non-null values in key order with newlines,
/// skipping transport metadata fields the remote service attaches to every
/// response.
#[derive(Debug, Clone)]
pub struct JoinFormatter {
    skip_keys: Vec<&'static str>,
}

impl Default for JoinFormatter {
    fn default() -> Self {
        JoinFormatter {
            skip_keys: vec![
                "id",
                "workflow_id",
                "status",
                "error",
                "elapsed_time",
                "total_tokens",
                "total_steps",
                "created_at",
                "finished_at",
            ],
        }
    }
}

impl OutputFormatter for JoinFormatter {
    fn render(&self, outputs: &OutputMap) -> String {
        let parts: Vec<String> = outputs
            .iter()
            .filter(|(key, value)| !self.skip_keys.contains(&key.as_str()) && !value.is_null())
            .map(|(_, value)| value.to_string())
            .filter(|rendered| !rendered.trim().is_empty())
            .collect();

        if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        }
    }
}
