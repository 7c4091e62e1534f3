// ABOUTME: TOML configuration with ${NAME} environment interpolation
// ABOUTME: Destination, state store, extraction, schedule, report, and mapping settings plus validation

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::sync::{CronTrigger, EngineOptions, Mapping};

/// Default configuration file name in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_concurrency")]
    pub max_concurrent_mappings: usize,
    /// IANA zone for date-times read without zone information.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Opt-in for additive destination schema changes.
    #[serde(default)]
    pub allow_schema_additions: bool,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    /// Warehouse connection URL.
    #[serde(default)]
    pub url: String,
    /// Schema that holds the replicated tables.
    #[serde(default)]
    pub dataset: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    #[default]
    Local,
    Gcs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub store: StateStoreKind,
    #[serde(default = "default_state_path")]
    pub local_path: PathBuf,
    #[serde(default)]
    pub gcs_bucket: Option<String>,
    #[serde(default)]
    pub gcs_prefix: Option<String>,
    #[serde(default)]
    pub gcs_endpoint: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            store: StateStoreKind::Local,
            local_path: default_state_path(),
            gcs_bucket: None,
            gcs_prefix: None,
            gcs_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 0 disables the per-attempt deadline.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl ExtractConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: (self.attempt_timeout_secs > 0)
                .then(|| Duration::from_secs(self.attempt_timeout_secs)),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Five-field `m h dom mon dow` expression.
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub directory: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            directory: default_report_dir(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/state.json")
}

fn default_page_size() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

fn default_cron() -> String {
    "0 2 * * *".to_string()
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

/// Replace every `${NAME}` (NAME in `[A-Z0-9_]+`) with `lookup(NAME)`, or
/// the empty string when the lookup has nothing.
///
/// ```
/// # use warehouse_replicator::config::interpolate_env;
/// let out = interpolate_env("url = \"${HOST}:${MISSING}\"", |k| {
///     (k == "HOST").then(|| "db".to_string())
/// })
/// .unwrap();
/// assert_eq!(out, "url = \"db:\"");
/// ```
pub fn interpolate_env(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let pattern = Regex::new(r"\$\{([A-Z0-9_]+)\}")
        .map_err(|e| SyncError::Config(format!("invalid interpolation pattern: {}", e)))?;
    Ok(pattern
        .replace_all(raw, |caps: &Captures| lookup(&caps[1]).unwrap_or_default())
        .into_owned())
}

impl Config {
    /// Read, interpolate from the process environment, parse, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::parse(&raw, |key| std::env::var(key).ok())
    }

    /// Parse a configuration document with an injectable variable lookup.
    pub fn parse(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = interpolate_env(raw, lookup)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.destination.url.trim().is_empty() {
            return Err(SyncError::Config("destination.url is required".to_string()));
        }
        if self.destination.dataset.trim().is_empty() {
            return Err(SyncError::Config("destination.dataset is required".to_string()));
        }
        if self.max_concurrent_mappings == 0 {
            return Err(SyncError::Config(
                "max_concurrent_mappings must be at least 1".to_string(),
            ));
        }
        if self.extract.page_size == 0 {
            return Err(SyncError::Config("extract.page_size must be positive".to_string()));
        }
        if self.extract.max_attempts == 0 {
            return Err(SyncError::Config(
                "extract.max_attempts must be at least 1".to_string(),
            ));
        }

        let timezone = self.timezone()?;

        if self.state.store == StateStoreKind::Gcs
            && self
                .state
                .gcs_bucket
                .as_deref()
                .map_or(true, |b| b.trim().is_empty())
        {
            return Err(SyncError::Config(
                "state.gcs_bucket is required when state.store = \"gcs\"".to_string(),
            ));
        }

        CronTrigger::new(&self.schedule.cron, timezone)?;

        let mut names = HashSet::new();
        for mapping in &self.mappings {
            mapping.validate()?;
            if !names.insert(mapping.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate mapping name: {}",
                    mapping.name
                )));
            }
        }

        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.default_timezone.parse::<Tz>().map_err(|e| {
            SyncError::Config(format!(
                "default_timezone '{}' is not a known time zone: {}",
                self.default_timezone, e
            ))
        })
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            page_size: self.extract.page_size,
            allow_schema_additions: self.allow_schema_additions,
            timezone: self.timezone()?,
            max_concurrent_mappings: self.max_concurrent_mappings,
        })
    }

    pub fn cron_trigger(&self) -> Result<CronTrigger> {
        CronTrigger::new(&self.schedule.cron, self.timezone()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LoadMode;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
max_concurrent_mappings = 2
default_timezone = "Europe/Berlin"
allow_schema_additions = true

[destination]
url = "${WAREHOUSE_URL}"
dataset = "analytics"

[state]
store = "gcs"
gcs_bucket = "etl-state"
gcs_prefix = "prod"

[extract]
page_size = 500

[schedule]
cron = "15 3 * * 1-5"

[[mappings]]
name = "orders"
source_table = "orders"
destination_table = "orders"
incremental_column = "updated_at"
mode = "upsert"
primary_keys = ["id"]
backfill_start = "2024-01-01 00:00:00"

[[mappings]]
name = "events"
source_table = "events"
destination_table = "raw_events"
incremental_column = "id"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::parse(SAMPLE, env(&[("WAREHOUSE_URL", "postgresql://wh/db")])).unwrap();

        assert_eq!(config.destination.url, "postgresql://wh/db");
        assert_eq!(config.max_concurrent_mappings, 2);
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.state.store, StateStoreKind::Gcs);
        assert_eq!(config.extract.page_size, 500);
        assert_eq!(config.extract.max_attempts, 5);
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0].mode, LoadMode::Upsert);
        assert_eq!(config.mappings[1].mode, LoadMode::Append);
        assert_eq!(config.report.directory, PathBuf::from("reports"));
    }

    #[test]
    fn test_unset_variable_interpolates_to_empty() {
        let out = interpolate_env("a=${NOPE}b", |_| None).unwrap();
        assert_eq!(out, "a=b");
        // Lowercase names are not placeholders.
        let out = interpolate_env("${lower}", |_| Some("x".to_string())).unwrap();
        assert_eq!(out, "${lower}");
    }

    #[test]
    fn test_missing_destination_url_is_rejected() {
        let err = Config::parse(SAMPLE, env(&[])).unwrap_err();
        assert!(err.to_string().contains("destination.url"), "got: {err}");
    }

    #[test]
    fn test_upsert_without_keys_is_rejected() {
        let doc = SAMPLE.replace("primary_keys = [\"id\"]", "");
        let err = Config::parse(&doc, env(&[("WAREHOUSE_URL", "postgresql://wh/db")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_duplicate_mapping_names_rejected() {
        let doc = SAMPLE.replace("name = \"events\"", "name = \"orders\"");
        let err = Config::parse(&doc, env(&[("WAREHOUSE_URL", "postgresql://wh/db")])).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    #[test]
    fn test_bad_schedule_and_timezone_rejected() {
        let url = [("WAREHOUSE_URL", "postgresql://wh/db")];
        let doc = SAMPLE.replace("15 3 * * 1-5", "every day");
        assert!(Config::parse(&doc, env(&url)).is_err());

        let doc = SAMPLE.replace("Europe/Berlin", "Mars/Olympus");
        assert!(Config::parse(&doc, env(&url)).is_err());
    }

    #[test]
    fn test_gcs_requires_bucket() {
        let doc = SAMPLE.replace("gcs_bucket = \"etl-state\"", "");
        let err = Config::parse(&doc, env(&[("WAREHOUSE_URL", "postgresql://wh/db")])).unwrap_err();
        assert!(err.to_string().contains("gcs_bucket"), "got: {err}");
    }

    #[test]
    fn test_retry_policy_from_extract_settings() {
        let extract = ExtractConfig {
            attempt_timeout_secs: 0,
            ..ExtractConfig::default()
        };
        let policy = extract.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.attempt_timeout.is_none());
    }
}
