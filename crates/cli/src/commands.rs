use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a CSV batch against a workflow
    Run {
        /// CSV file with a header row; each data row becomes one invocation
        #[arg(long)]
        input: PathBuf,

        /// Workflow reference to invoke for every row
        #[arg(long)]
        workflow: String,

        /// Batch name; defaults to the input file name
        #[arg(long)]
        name: Option<String>,

        /// Parallel invocations within the batch
        #[arg(long, default_value_t = 3)]
        concurrency: usize,

        /// Retries per row for transient failures
        #[arg(long, default_value_t = 2)]
        retries: u32,

        /// Per-invocation timeout in seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Where to write the result CSV; defaults next to the input
        #[arg(long)]
        output: Option<PathBuf>,

        /// Simulator: added latency per invocation, in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,

        /// Simulator: fail every N-th invocation transiently (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
    },
    /// List batches
    List {
        #[arg(long, help = "Filter by state: pending, running, paused, ...")]
        state: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        size: usize,

        #[arg(long, help = "Print as JSON instead of a table")]
        json: bool,
    },
    /// Show live progress for a batch
    Progress {
        #[arg(long, help = "Batch ID to inspect")]
        batch: String,

        #[arg(long, help = "Print as JSON instead of a table")]
        json: bool,
    },
    /// Reset a batch's failed rows and run them again
    RetryFailed {
        #[arg(long, help = "Batch ID to retry")]
        batch: String,

        /// Simulator: added latency per invocation, in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
}
