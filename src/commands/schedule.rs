// ABOUTME: schedule command - runs run-once at every cron fire time
// ABOUTME: Stops waiting for the next fire time on Ctrl+C

use anyhow::{Context, Result};

use crate::config::Config;

use super::{run_once, Runtime};

/// Run every mapping at each fire time of `schedule.cron` until Ctrl+C.
///
/// The cron expression is evaluated in `default_timezone`. Connections are
/// opened once and reused across runs.
pub async fn schedule(config: &Config) -> Result<()> {
    let trigger = config.cron_trigger().context("Invalid schedule")?;
    let runtime = Runtime::connect(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(());
    });

    tracing::info!("Press Ctrl+C to stop");
    let runtime_ref = &runtime;
    trigger
        .run(shutdown_rx, move || async move {
            run_once::execute(runtime_ref, config).await;
        })
        .await;

    runtime.close().await;
    Ok(())
}
