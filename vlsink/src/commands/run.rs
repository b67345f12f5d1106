use anyhow::{Context, Result};
use tracing::info;

use crate::{config::RunConfig, supervisor::Supervisor};

pub async fn run(config: RunConfig) -> Result<()> {
    info!("Starting vlsink");

    let supervisor = Supervisor::start(&config)
        .await
        .context("Failed to start ingestion workers")?;

    info!("vlsink is running. Press Ctrl+C to stop.");
    shutdown_signal()
        .await
        .context("Failed to listen for shutdown signals")?;

    info!("Shutdown requested, draining in-flight batches");
    supervisor.shutdown().await;

    info!("vlsink shutdown complete");
    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
