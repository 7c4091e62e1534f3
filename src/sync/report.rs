// ABOUTME: RunReport - per-mapping outcome of one run
// ABOUTME: Serialized as a JSON array to <directory>/report.json after every run

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::mapping::LoadMode;

/// Outcome of one mapping in one run. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub mapping_name: String,
    pub mode: LoadMode,
    pub records_processed: u64,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

impl RunReport {
    pub fn new(mapping_name: &str, mode: LoadMode) -> Self {
        Self {
            mapping_name: mapping_name.to_string(),
            mode,
            records_processed: 0,
            errors: Vec::new(),
            duration_seconds: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Write `reports` to `<directory>/report.json`, replacing any previous file.
pub fn write_report(reports: &[RunReport], directory: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create report directory {:?}", directory))?;

    let path = directory.join("report.json");
    let contents = serde_json::to_string_pretty(reports).context("Failed to serialize run report")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("Failed to write run report to {:?}", path))?;

    Ok(path)
}
