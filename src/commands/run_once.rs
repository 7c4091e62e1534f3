// ABOUTME: run-once command - syncs every configured mapping a single time
// ABOUTME: Writes the run report and logs each entry; mapping failures do not fail the command

use anyhow::Result;

use crate::config::Config;
use crate::sync::{write_report, RunReport};

use super::{log_reports, Runtime};

/// Run every mapping once and write `<report.directory>/report.json`.
///
/// # Returns
///
/// The per-mapping reports in configuration order. Only connection and
/// configuration problems are returned as errors.
pub async fn run_once(config: &Config) -> Result<Vec<RunReport>> {
    let runtime = Runtime::connect(config).await?;
    let reports = execute(&runtime, config).await;
    runtime.close().await;
    Ok(reports)
}

pub(crate) async fn execute(runtime: &Runtime, config: &Config) -> Vec<RunReport> {
    if config.mappings.is_empty() {
        tracing::warn!("No mappings configured; nothing to do");
    }

    let reports = runtime.engine.run_once(&config.mappings).await;
    publish(&reports, config);
    reports
}

/// Write and log reports. A report that cannot be written is only a warning.
pub(crate) fn publish(reports: &[RunReport], config: &Config) {
    match write_report(reports, &config.report.directory) {
        Ok(path) => tracing::info!("Run report written to {}", path.display()),
        Err(e) => tracing::warn!("Failed to write run report: {:?}", e),
    }
    log_reports(reports);

    let failed = reports.iter().filter(|r| !r.is_success()).count();
    tracing::info!(
        "Run complete: {} mapping(s), {} failed",
        reports.len(),
        failed
    );
}
