//! Binary entry point: load configuration, wire the application, and run
//! until SIGINT/SIGTERM triggers graceful shutdown.

use std::time::Duration;

use alert_control_plane::app::App;
use alert_control_plane::config::Config;
use alert_control_plane::logging::{log_info, LogCategory};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .map_err(|e| eyre::eyre!("failed to install metrics exporter: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = Config::load()?;
    let app = App::build(config).await?;

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log_info(LogCategory::System, "shutdown signal received, cancelling all subsystems");
        shutdown_cancel.cancel();
    });

    app.run(cancel).await;

    // Give cancelled I/O (database/cache/HTTP) a moment to unwind cleanly
    // before the process exits.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
