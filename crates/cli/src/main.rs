use crate::commands::Commands;
use crate::csv_rows::{CsvResultSink, CsvRowSource, default_results_path};
use crate::error::CliError;
use clap::Parser;
use engine_core::store::sled_store::SledBatchStore;
use engine_core::store::{BatchFilter, BatchStore, Page};
use engine_runtime::controller::{BatchController, ControllerParams};
use engine_runtime::progress::ProgressTracker;
use engine_runtime::recovery::recover;
use model::batch::{Batch, BatchState};
use model::options::{BatchDescriptor, BatchOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

mod commands;
mod csv_rows;
mod error;
mod output;
mod shutdown;
mod sim;

#[derive(Parser)]
#[command(name = "rowflow", version = "0.1.0", about = "Batch executor for remote workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory for the engine's durable state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let exit_code = match run_cli().await {
        Ok(()) => 0,
        Err(CliError::ShutdownRequested) => {
            info!("stopped on request; progress is saved and resumes on the next run");
            130 // Standard exit code for SIGINT
        }
        Err(err) => {
            tracing::error!("application error: {err}");
            1
        }
    };

    process::exit(exit_code);
}

async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    shutdown::listen_for_shutdown(cancel.clone());

    let store = open_store(cli.state_dir.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            workflow,
            name,
            concurrency,
            retries,
            timeout_secs,
            output,
            latency_ms,
            fail_every,
        } => {
            let output_path = output.unwrap_or_else(|| default_results_path(&input));
            let controller = build_controller(
                store.clone(),
                Arc::new(CsvRowSource::new(&input)),
                Arc::new(CsvResultSink::new(&output_path)),
                latency_ms,
                fail_every,
            );

            run_recovery(&store, &controller).await?;

            let options = BatchOptions {
                name: name.unwrap_or_else(|| display_name(&input)),
                max_concurrency: concurrency,
                retry_count: retries,
                timeout_per_call: Duration::from_secs(timeout_secs),
            };
            let descriptor =
                BatchDescriptor::new(&workflow, &input.display().to_string(), options);

            let batch = controller.create_batch(&descriptor).await?;
            info!(batch_id = %batch.id, rows = batch.total, "batch created, starting");
            controller.start_batch(&batch.id).await?;

            let finished = watch_batch(&controller, &batch.id, &cancel).await?;
            output::print_batch_summary(&finished);
            output::print_metrics(&controller.metrics());
            Ok(())
        }
        Commands::List {
            state,
            page,
            size,
            json,
        } => {
            let filter = BatchFilter {
                state: state
                    .map(|raw| {
                        raw.parse::<BatchState>()
                            .map_err(CliError::InvalidStateFilter)
                    })
                    .transpose()?,
                ..BatchFilter::default()
            };
            let listing = store.list_batches(&filter, Page { page, size }).await?;

            if json {
                let rendered = serde_json::to_string_pretty(&listing.batches)
                    .map_err(CliError::JsonSerialize)?;
                println!("{rendered}");
            } else {
                output::print_batches(&listing);
            }
            Ok(())
        }
        Commands::Progress { batch, json } => {
            let tracker = ProgressTracker::new(store.clone(), Duration::from_secs(2));
            let snapshot = tracker.snapshot_now(&batch).await?;

            if json {
                let rendered =
                    serde_json::to_string_pretty(&snapshot).map_err(CliError::JsonSerialize)?;
                println!("{rendered}");
            } else {
                output::print_progress(&snapshot);
            }
            Ok(())
        }
        Commands::RetryFailed { batch, latency_ms } => {
            let target = store.get_batch(&batch).await?;
            let sink_path = target
                .result_ref
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| default_results_path(Path::new(&target.source_ref)));

            let controller = build_controller(
                store.clone(),
                Arc::new(CsvRowSource::new(&target.source_ref)),
                Arc::new(CsvResultSink::new(&sink_path)),
                latency_ms,
                0,
            );
            run_recovery(&store, &controller).await?;

            let reset = controller.retry_all_failed(&batch).await?;
            if reset == 0 {
                println!("no failed rows to retry");
                return Ok(());
            }
            info!(batch_id = %batch, reset, "failed rows requeued");

            let finished = watch_batch(&controller, &batch, &cancel).await?;
            output::print_batch_summary(&finished);
            Ok(())
        }
    }
}

fn open_store(state_dir: Option<&Path>) -> Result<Arc<dyn BatchStore>, CliError> {
    let path = match state_dir {
        Some(path) => path.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| CliError::Unexpected("could not determine home directory".into()))?
            .join(".rowflow/state"),
    };
    let store = SledBatchStore::open(&path)?;
    Ok(Arc::new(store))
}

fn build_controller(
    store: Arc<dyn BatchStore>,
    source: Arc<CsvRowSource>,
    sink: Arc<CsvResultSink>,
    latency_ms: u64,
    fail_every: u64,
) -> BatchController {
    let invoker = sim::build_invoker(latency_ms, fail_every);
    let provider = Arc::new(sim::SimulatedProvider::new(invoker));
    BatchController::new(ControllerParams::new(store, source, sink, provider))
}

async fn run_recovery(
    store: &Arc<dyn BatchStore>,
    controller: &BatchController,
) -> Result<(), CliError> {
    let report = recover(store, controller).await?;
    if report.found > 0 {
        info!(
            resumed = report.resumed.len(),
            finalized = report.finalized.len(),
            failed = report.failed.len(),
            "recovered interrupted batches"
        );
    }
    Ok(())
}

/// Print progress lines until the batch reaches a terminal state, stopping
/// early on a shutdown request.
async fn watch_batch(
    controller: &BatchController,
    batch_id: &str,
    cancel: &CancellationToken,
) -> Result<Batch, CliError> {
    let tracker = controller.tracker();
    let mut updates = tracker.subscribe(batch_id).await;
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = updates.recv().await {
            output::print_progress_line(&snapshot);
        }
    });

    let finished = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                controller.shutdown().await;
                printer.abort();
                return Err(CliError::ShutdownRequested);
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                let current = controller.get_batch(batch_id).await?;
                if current.is_terminal() {
                    break current;
                }
            }
        }
    };
    printer.abort();
    Ok(finished)
}

fn display_name(input: &Path) -> String {
    input
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "batch".to_string())
}
