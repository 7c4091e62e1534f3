// ABOUTME: Mapping descriptor - one source table replicated into one destination table
// ABOUTME: Carries the load mode, cursor column, key columns, and optional backfill start

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::utils::validate_identifier;

/// How loaded rows are applied to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Append,
    Upsert,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Append => f.write_str("append"),
            LoadMode::Upsert => f.write_str("upsert"),
        }
    }
}

/// A configured replication unit. Read-only during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Unique key; also the key of the mapping's watermark.
    pub name: String,
    pub source_table: String,
    pub destination_table: String,
    pub incremental_column: String,
    #[serde(default)]
    pub mode: LoadMode,
    /// Required and non-empty for upsert mappings.
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Lower bound used while no watermark is stored.
    #[serde(default)]
    pub backfill_start: Option<String>,
}

impl Mapping {
    /// Check the descriptor on its own. Failures are configuration errors.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Config("mapping name cannot be empty".to_string()));
        }

        for (what, identifier) in [
            ("source_table", &self.source_table),
            ("destination_table", &self.destination_table),
            ("incremental_column", &self.incremental_column),
        ] {
            validate_identifier(identifier).map_err(|e| {
                SyncError::Config(format!("mapping '{}': invalid {}: {}", self.name, what, e))
            })?;
        }

        if self.mode == LoadMode::Upsert && self.primary_keys.is_empty() {
            return Err(SyncError::Config(format!(
                "mapping '{}' uses upsert mode but has no primary_keys",
                self.name
            )));
        }
        for pk in &self.primary_keys {
            validate_identifier(pk).map_err(|e| {
                SyncError::Config(format!("mapping '{}': invalid primary key: {}", self.name, e))
            })?;
        }

        Ok(())
    }
}

/// Look up a mapping by name.
pub fn find_mapping<'a>(mappings: &'a [Mapping], name: &str) -> Result<&'a Mapping> {
    mappings
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| SyncError::Config(format!("mapping not found: {}", name)))
}
