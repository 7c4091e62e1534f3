// ABOUTME: Loader - delivers normalized batches to the warehouse as append or staged upsert
// ABOUTME: Upserts go through a per-run staging table that is dropped on every exit path

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::schema::TableSpec;
use crate::utils::MAX_IDENTIFIER_LEN;
use crate::value::Record;

use super::Warehouse;

/// Build the staging table name for one upsert run.
///
/// `_<table>_staging_<run_id>`; the table part is shortened so the whole
/// name fits the warehouse identifier limit while the run id stays intact.
pub fn staging_table_name(table: &str, run_id: &str) -> String {
    let fixed = "_".len() + "_staging_".len() + run_id.len();
    let room = MAX_IDENTIFIER_LEN.saturating_sub(fixed);
    let table_part: String = table.chars().take(room).collect();
    format!("_{}_staging_{}", table_part, run_id)
}

/// Delivers batches of aligned rows to the destination.
///
/// The loader never advances watermarks and is not idempotent for appends:
/// the caller guarantees the same logical rows are not delivered twice.
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Append rows as a single batch job. Returns 0 without touching the
    /// destination when `rows` is empty.
    pub async fn load_append(&self, table: &TableSpec, rows: &[Record]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let loaded = self.warehouse.insert_rows(&table.name, rows).await?;
        tracing::info!("Appended {} rows to {}", loaded, table.name);
        Ok(loaded)
    }

    /// Load rows through a staging table and merge them into `table` by key.
    ///
    /// Steps: ensure the target exists, create a staging table unique to
    /// `run_id`, load the batch into it, merge, and drop the staging table.
    /// The drop runs whether or not the earlier steps succeeded.
    pub async fn load_upsert(
        &self,
        table: &TableSpec,
        rows: &[Record],
        primary_keys: &[String],
        run_id: &str,
    ) -> Result<u64> {
        if primary_keys.is_empty() {
            return Err(SyncError::Config(format!(
                "upsert into {} requires at least one primary key column",
                table.name
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let columns: Vec<String> = rows[0].columns().map(str::to_string).collect();
        if let Some(missing) = primary_keys.iter().find(|pk| !columns.contains(pk)) {
            return Err(SyncError::Config(format!(
                "primary key column '{}' is not part of the rows loaded into {}",
                missing, table.name
            )));
        }

        let batch = dedupe_by_key(rows, primary_keys);
        if batch.len() < rows.len() {
            tracing::debug!(
                "Collapsed {} duplicate key(s) in batch for {}",
                rows.len() - batch.len(),
                table.name
            );
        }

        self.warehouse.ensure_table(table).await?;

        let staging = staging_table_name(&table.name, run_id);
        let result = self
            .stage_and_merge(&table.name, &staging, &batch, &columns, primary_keys)
            .await;

        if let Err(e) = self.warehouse.drop_table(&staging).await {
            tracing::warn!("Failed to drop staging table {}: {}", staging, e);
        }

        let merged = result?;
        tracing::info!(
            "Upserted {} rows into {} (merge affected {})",
            batch.len(),
            table.name,
            merged
        );
        Ok(batch.len() as u64)
    }

    async fn stage_and_merge(
        &self,
        target: &str,
        staging: &str,
        rows: &[&Record],
        columns: &[String],
        primary_keys: &[String],
    ) -> Result<u64> {
        self.warehouse.create_staging_table(staging, target).await?;

        let owned: Vec<Record> = rows.iter().map(|r| (*r).clone()).collect();
        self.warehouse.insert_rows(staging, &owned).await?;

        self.warehouse
            .merge(target, staging, columns, primary_keys)
            .await
    }
}

/// Keep the last row for every primary key, in order of those last rows.
///
/// Rows with a null in any key column never match in a merge, so they are
/// all kept.
fn dedupe_by_key<'a>(rows: &'a [Record], primary_keys: &[String]) -> Vec<&'a Record> {
    let key_of = |row: &Record| -> Option<Vec<String>> {
        primary_keys
            .iter()
            .map(|pk| row.get(pk).and_then(|v| v.to_text()))
            .collect()
    };

    let mut last_index: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        if let Some(key) = key_of(row) {
            last_index.insert(key, idx);
        }
    }

    rows.iter()
        .enumerate()
        .filter(|(idx, row)| match key_of(row) {
            Some(key) => last_index.get(&key) == Some(idx),
            None => true,
        })
        .map(|(_, row)| row)
        .collect()
}
