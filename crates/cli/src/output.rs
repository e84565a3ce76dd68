use engine_core::metrics::MetricsSnapshot;
use engine_core::store::BatchPage;
use engine_runtime::progress::ProgressSnapshot;
use model::batch::Batch;

pub fn print_batches(page: &BatchPage) {
    println!(
        "{:<38} {:<22} {:<10} {:>6} {:>6} {:>6}",
        "ID", "Name", "State", "Total", "Done", "Failed"
    );
    for batch in &page.batches {
        println!(
            "{:<38} {:<22} {:<10} {:>6} {:>6} {:>6}",
            batch.id, batch.name, batch.state, batch.total, batch.completed, batch.failed
        );
    }
    println!(
        "page {}/{} ({} batches)",
        page.page,
        page.pages().max(1),
        page.total
    );
}

pub fn print_batch_summary(batch: &Batch) {
    println!("Batch '{}' ({})", batch.name, batch.id);
    println!("-----------------------------");
    println!("{:<16} {}", "State", batch.state);
    println!("{:<16} {}", "Workflow", batch.workflow_ref);
    println!("{:<16} {}", "Total rows", batch.total);
    println!("{:<16} {}", "Succeeded", batch.completed);
    println!("{:<16} {}", "Failed", batch.failed);
    if batch.skipped > 0 {
        println!("{:<16} {}", "Skipped", batch.skipped);
    }
    if let Some(seconds) = batch.duration_seconds() {
        println!("{:<16} {}s", "Duration", seconds);
    }
    if let Some(error) = &batch.error_message {
        println!("{:<16} {}", "Error", error);
    }
    if let Some(result_ref) = &batch.result_ref {
        println!("{:<16} {}", "Results", result_ref);
    }
}

pub fn print_progress(snapshot: &ProgressSnapshot) {
    println!("Progress for batch '{}':", snapshot.batch_id);
    println!("-----------------------------");
    println!("{:<16} {}", "State", snapshot.state);
    println!(
        "{:<16} {}/{} ({:.1}%)",
        "Finished",
        snapshot.completed + snapshot.failed,
        snapshot.total,
        snapshot.progress_percentage
    );
    println!("{:<16} {}", "Running", snapshot.running);
    println!("{:<16} {}", "Pending", snapshot.pending);
    println!("{:<16} {}", "Failed", snapshot.failed);
    let avg = snapshot
        .average_execution_time
        .map(|avg| format!("{avg:.2}s"))
        .unwrap_or_else(|| "n/a".to_string());
    println!("{:<16} {}", "Avg row time", avg);
    let eta = snapshot
        .estimated_remaining_seconds
        .map(|eta| format!("{eta}s"))
        .unwrap_or_else(|| "n/a".to_string());
    println!("{:<16} {}", "Est. remaining", eta);
}

pub fn print_progress_line(snapshot: &ProgressSnapshot) {
    let eta = snapshot
        .estimated_remaining_seconds
        .map(|eta| format!(", ~{eta}s left"))
        .unwrap_or_default();
    println!(
        "{}/{} done ({:.1}%), running={}, failed={}{}",
        snapshot.completed + snapshot.failed,
        snapshot.total,
        snapshot.progress_percentage,
        snapshot.running,
        snapshot.failed,
        eta
    );
}

pub fn print_metrics(metrics: &MetricsSnapshot) {
    println!(
        "invocations={}, succeeded={}, failed={}, retries={}",
        metrics.invocations, metrics.rows_succeeded, metrics.rows_failed, metrics.retries
    );
}
