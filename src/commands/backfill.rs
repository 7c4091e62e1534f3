// ABOUTME: backfill command - re-loads a closed window for one mapping
// ABOUTME: Leaves the stored watermark untouched and fails when the window does not load

use anyhow::{Context, Result};

use crate::config::Config;
use crate::sync::{find_mapping, RunReport};

use super::{run_once, Runtime};

/// Re-load `[start, end]` (open-ended without `end`) for the named mapping.
///
/// The report is published either way; a failed mapping is returned as an
/// error so the process exits non-zero.
///
/// # Arguments
///
/// * `config` - Loaded configuration
/// * `mapping` - Name of a configured mapping
/// * `start` - Inclusive lower bound on the incremental column
/// * `end` - Optional inclusive upper bound
pub async fn backfill(
    config: &Config,
    mapping: &str,
    start: &str,
    end: Option<&str>,
) -> Result<RunReport> {
    let mapping = find_mapping(&config.mappings, mapping).context("Cannot start backfill")?;
    tracing::info!(
        "Backfilling mapping '{}' from {} to {}",
        mapping.name,
        start,
        end.unwrap_or("latest")
    );

    let runtime = Runtime::connect(config).await?;
    let report = runtime.engine.backfill(mapping, start, end).await;
    runtime.close().await;

    run_once::publish(std::slice::from_ref(&report), config);
    ensure_success(report)
}

fn ensure_success(report: RunReport) -> Result<RunReport> {
    if !report.is_success() {
        anyhow::bail!(
            "Backfill of mapping '{}' failed: {}",
            report.mapping_name,
            report.errors.join("; ")
        );
    }
    Ok(report)
}
