use async_trait::async_trait;
use engine_core::error::{SinkError, SourceError};
use engine_core::rows::{ResultSink, RowOutcome, RowResult, RowSource};
use model::value::{InputMap, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Row source backed by a CSV file. The header row names the input
/// columns; each data row becomes one invocation. Rows whose cells are all
/// empty are dropped before indexing, so row indices are positions in the
/// parsed row set.
pub struct CsvRowSource {
    path: PathBuf,
}

impl CsvRowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvRowSource { path: path.into() }
    }
}

#[async_trait]
impl RowSource for CsvRowSource {
    async fn rows(&self, _batch_id: &str) -> Result<Vec<(usize, InputMap)>, SourceError> {
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|err| SourceError::Io(format!("{}: {err}", self.path.display())))?;
        let headers = reader
            .headers()
            .map_err(|err| SourceError::Io(err.to_string()))?
            .clone();

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|err| SourceError::MalformedRow {
                row_index: line,
                message: err.to_string(),
            })?;

            let mut inputs = InputMap::new();
            for (header, cell) in headers.iter().zip(record.iter()) {
                inputs.insert(header.to_string(), Value::parse_cell(cell));
            }
            if inputs.values().all(Value::is_null) {
                debug!(line, "skipping empty row");
                continue;
            }
            rows.push((rows.len(), inputs));
        }
        Ok(rows)
    }

    async fn discard(&self, _batch_id: &str) -> Result<(), SourceError> {
        // The input file belongs to the user; deletion only covers engine
        // artifacts.
        debug!(path = %self.path.display(), "leaving input file in place");
        Ok(())
    }
}

/// Result sink writing a `row_index,status,result` CSV next to the input.
pub struct CsvResultSink {
    path: PathBuf,
}

impl CsvResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvResultSink { path: path.into() }
    }
}

/// Default result path for an input file: `<stem>-results.csv` alongside it.
pub fn default_results_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "batch".to_string());
    input.with_file_name(format!("{stem}-results.csv"))
}

#[async_trait]
impl ResultSink for CsvResultSink {
    async fn assemble(&self, batch_id: &str, results: &[RowResult]) -> Result<String, SinkError> {
        let mut writer =
            csv::Writer::from_path(&self.path).map_err(|err| SinkError::Io(err.to_string()))?;
        writer
            .write_record(["row_index", "status", "result"])
            .map_err(|err| SinkError::Io(err.to_string()))?;

        for row in results {
            let (status, rendered) = match &row.outcome {
                RowOutcome::Success(rendered) => ("success", rendered.as_str()),
                RowOutcome::Failure(message) => ("failed", message.as_str()),
            };
            writer
                .write_record([row.row_index.to_string().as_str(), status, rendered])
                .map_err(|err| SinkError::Io(err.to_string()))?;
        }
        writer.flush().map_err(|err| SinkError::Io(err.to_string()))?;

        info!(batch_id = %batch_id, path = %self.path.display(), "result file written");
        Ok(self.path.display().to_string())
    }

    async fn discard(&self, _batch_id: &str) -> Result<(), SinkError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SinkError::Io(err.to_string())),
        }
    }
}
