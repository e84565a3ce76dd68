use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel the root token on SIGINT or SIGTERM so running batches wind
/// down. Their progress is already on disk; recovery resumes them at the
/// next start.
pub fn listen_for_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        info!(signal = name, "shutdown requested, cancelling running work");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = signal::ctrl_c().await;
    "SIGINT"
}
