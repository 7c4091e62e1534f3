// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Wires configuration into a SyncEngine and exports run-once, schedule, and backfill

pub mod backfill;
pub mod run_once;
pub mod schedule;

pub use backfill::backfill;
pub use run_once::run_once;
pub use schedule::schedule;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{Config, StateStoreKind};
use crate::source::{Extractor, MySqlParams, MySqlReader};
use crate::state::{GcsBackend, LocalFileBackend, StateBackend, WatermarkStore};
use crate::sync::{RunReport, SyncEngine};
use crate::utils::sanitize_url;
use crate::warehouse::PostgresWarehouse;

/// Environment variable holding the OAuth2 token for the GCS state store
pub const GCS_TOKEN_ENV: &str = "GCS_ACCESS_TOKEN";

/// Connected collaborators for one command invocation.
pub struct Runtime {
    pub engine: SyncEngine,
    reader: Arc<MySqlReader>,
}

impl Runtime {
    /// Connect the source, the warehouse, and the watermark store
    /// described by `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let retry = config.extract.retry_policy();

        let params = MySqlParams::from_env().context("Invalid MySQL connection settings")?;
        let reader = Arc::new(MySqlReader::new(&params));
        tracing::info!("Source: MySQL {}:{}/{}", params.host, params.port, params.database);

        tracing::info!(
            "Destination: {} (dataset {})",
            sanitize_url(&config.destination.url),
            config.destination.dataset
        );
        let warehouse = PostgresWarehouse::connect(
            &config.destination.url,
            &config.destination.dataset,
            &retry,
        )
        .await
        .context("Failed to connect to destination warehouse")?;

        let backend = state_backend(config)?;
        let watermarks = Arc::new(WatermarkStore::with_retry(backend, retry.clone()));
        tracing::info!("Watermarks: {}", watermarks.describe());

        let extractor = Extractor::new(reader.clone(), retry);
        let engine = SyncEngine::new(
            extractor,
            Arc::new(warehouse),
            watermarks,
            config.engine_options()?,
        );

        Ok(Self { engine, reader })
    }

    /// Release pooled source connections.
    pub async fn close(self) {
        if let Err(e) = self.reader.close().await {
            tracing::warn!("Failed to close MySQL pool cleanly: {}", e);
        }
    }
}

/// Build the state backend selected by `state.store`.
pub fn state_backend(config: &Config) -> Result<Arc<dyn StateBackend>> {
    let state = &config.state;
    let backend: Arc<dyn StateBackend> = match state.store {
        StateStoreKind::Local => Arc::new(LocalFileBackend::new(&state.local_path)),
        StateStoreKind::Gcs => {
            let token = std::env::var(GCS_TOKEN_ENV).ok().filter(|t| !t.is_empty());
            if token.is_none() {
                tracing::warn!(
                    "{} is not set; GCS requests will be unauthenticated",
                    GCS_TOKEN_ENV
                );
            }
            Arc::new(
                GcsBackend::new(
                    state.gcs_bucket.as_deref().unwrap_or_default(),
                    state.gcs_prefix.as_deref().unwrap_or_default(),
                    state.gcs_endpoint.as_deref(),
                    token,
                )
                .context("Invalid GCS state store settings")?,
            )
        }
    };
    Ok(backend)
}

/// Log one line per report entry, failures at error level.
pub fn log_reports(reports: &[RunReport]) {
    for report in reports {
        if report.is_success() {
            tracing::info!(
                "[{}] {} mode: {} record(s) in {:.2}s",
                report.mapping_name,
                report.mode,
                report.records_processed,
                report.duration_seconds
            );
        } else {
            tracing::error!(
                "[{}] {} mode failed after {:.2}s: {}",
                report.mapping_name,
                report.mode,
                report.duration_seconds,
                report.errors.join("; ")
            );
        }
    }
}
