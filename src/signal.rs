#[cfg(unix)]
async fn wait_for_signal_impl() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal_impl() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "CTRL_C"
}

/// Waits for a signal that requests a graceful shutdown.
pub async fn wait_for_stop_signal() -> &'static str {
    wait_for_signal_impl().await
}
