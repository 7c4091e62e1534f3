// ABOUTME: SyncEngine - drives each mapping through discovery, reconcile, paginate, transform, load, and watermark
// ABOUTME: Failures are caught per mapping and recorded on its report with the stage they occurred in

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono_tz::Tz;
use futures::stream::{self, StreamExt};

use crate::error::{Result, SyncError};
use crate::schema::{SchemaReconciler, TableSpec};
use crate::source::{Extractor, PageRequest};
use crate::state::WatermarkStore;
use crate::transform::Transformer;
use crate::value::Record;
use crate::warehouse::{Loader, Warehouse};

use super::mapping::{LoadMode, Mapping};
use super::report::RunReport;

/// Stages a mapping moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    DiscoverSchema,
    Reconcile,
    Paginate,
    Transform,
    Load,
    AdvanceWatermark,
    Done,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::DiscoverSchema => "discover schema",
            SyncStage::Reconcile => "reconcile",
            SyncStage::Paginate => "paginate",
            SyncStage::Transform => "transform",
            SyncStage::Load => "load",
            SyncStage::AdvanceWatermark => "advance watermark",
            SyncStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A mapping failure and the stage it happened in.
#[derive(Debug)]
pub struct StageError {
    pub stage: SyncStage,
    pub error: SyncError,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn at(stage: SyncStage) -> impl FnOnce(SyncError) -> StageError {
    move |error| StageError { stage, error }
}

/// Tunables shared by every mapping of a run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Rows per source page.
    pub page_size: usize,
    /// Add missing destination columns instead of only warning.
    pub allow_schema_additions: bool,
    /// Zone assumed for date-times that carry none.
    pub timezone: Tz,
    /// Mappings processed at the same time by `run_once`.
    pub max_concurrent_mappings: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            allow_schema_additions: false,
            timezone: Tz::UTC,
            max_concurrent_mappings: 1,
        }
    }
}

/// Which rows a pass reads and whether it may move the watermark.
#[derive(Debug, Clone)]
enum Window {
    /// From the stored watermark (or the mapping's backfill start) onwards.
    Incremental,
    /// Closed operator-supplied range; never touches the watermark.
    Backfill { start: String, end: Option<String> },
}

/// Result of reading every page of one pass.
struct Extracted {
    rows: Vec<Record>,
    pages: usize,
    /// Encoded cursor value of the last row read, if any row was read.
    last_value: Option<String>,
}

/// Orchestrates mappings end-to-end.
pub struct SyncEngine {
    extractor: Extractor,
    warehouse: Arc<dyn Warehouse>,
    loader: Loader,
    watermarks: Arc<WatermarkStore>,
    transformer: Transformer,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        extractor: Extractor,
        warehouse: Arc<dyn Warehouse>,
        watermarks: Arc<WatermarkStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            extractor,
            loader: Loader::new(warehouse.clone()),
            warehouse,
            watermarks,
            transformer: Transformer::new(options.timezone),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Run every mapping once. One mapping's failure never stops the others.
    ///
    /// Reports come back in the order of `mappings`.
    pub async fn run_once(&self, mappings: &[Mapping]) -> Vec<RunReport> {
        let concurrency = self.options.max_concurrent_mappings.max(1);
        tracing::info!(
            "Starting run of {} mapping(s) (concurrency {})",
            mappings.len(),
            concurrency
        );

        stream::iter(mappings.iter().map(|m| self.run_mapping(m)))
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Incrementally sync one mapping and report the outcome.
    pub async fn run_mapping(&self, mapping: &Mapping) -> RunReport {
        self.run_with_report(mapping, Window::Incremental).await
    }

    /// Re-load the closed range `[start, end]` (open-ended without `end`)
    /// for one mapping. The stored watermark is left alone.
    pub async fn backfill(&self, mapping: &Mapping, start: &str, end: Option<&str>) -> RunReport {
        let window = Window::Backfill {
            start: start.to_string(),
            end: end.map(str::to_string),
        };
        self.run_with_report(mapping, window).await
    }

    async fn run_with_report(&self, mapping: &Mapping, window: Window) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(&mapping.name, mapping.mode);

        match self.execute(mapping, &window).await {
            Ok(loaded) => {
                report.records_processed = loaded;
                tracing::info!(
                    "Mapping {} completed: {} rows in {:.2}s",
                    mapping.name,
                    loaded,
                    started.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                // Log with :? to show full error chain including root cause
                tracing::error!("Mapping {} failed: {:?}", mapping.name, e);
                report.errors.push(e.to_string());
            }
        }

        report.duration_seconds = started.elapsed().as_secs_f64();
        report
    }

    async fn execute(&self, mapping: &Mapping, window: &Window) -> std::result::Result<u64, StageError> {
        let run_id = run_id();
        let mut stage = SyncStage::DiscoverSchema;
        tracing::info!("Mapping {} [{}]: {}", mapping.name, run_id, stage);

        mapping.validate().map_err(at(stage))?;
        let source_columns = self
            .extractor
            .discover_columns(&mapping.source_table)
            .await
            .map_err(at(stage))?;
        let source_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
        if !source_names.contains(&mapping.incremental_column) {
            return Err(at(stage)(SyncError::Config(format!(
                "incremental column {} does not exist in {}",
                mapping.incremental_column, mapping.source_table
            ))));
        }

        stage = SyncStage::Reconcile;
        tracing::info!("Mapping {} [{}]: {}", mapping.name, run_id, stage);
        let full_spec = TableSpec::from_descriptors(&mapping.destination_table, &source_columns);
        if let Err(e) = self.warehouse.ensure_table(&full_spec).await {
            tracing::warn!(
                "Could not ensure destination table {}: {}",
                mapping.destination_table,
                e
            );
        }
        let outcome = SchemaReconciler::new(self.warehouse.as_ref())
            .reconcile(
                &mapping.destination_table,
                &source_columns,
                self.options.allow_schema_additions,
            )
            .await;
        let load_spec = TableSpec::new(
            mapping.destination_table.clone(),
            full_spec
                .columns
                .into_iter()
                .filter(|(name, _)| !outcome.absent.contains(name))
                .collect(),
        );
        let load_columns = load_spec.column_names();

        stage = SyncStage::Paginate;
        let (lower, upper) = match window {
            Window::Incremental => {
                let stored = self
                    .watermarks
                    .get(&mapping.name)
                    .await
                    .map_err(at(stage))?;
                (stored.or_else(|| mapping.backfill_start.clone()), None)
            }
            Window::Backfill { start, end } => (Some(start.clone()), end.clone()),
        };
        tracing::info!(
            "Mapping {} [{}]: {} from {} to {}",
            mapping.name,
            run_id,
            stage,
            lower.as_deref().unwrap_or("<start>"),
            upper.as_deref().unwrap_or("<end>")
        );
        let extracted = self
            .paginate(mapping, &source_names, lower, upper)
            .await
            .map_err(at(stage))?;
        tracing::info!(
            "Mapping {}: read {} rows in {} page(s)",
            mapping.name,
            extracted.rows.len(),
            extracted.pages
        );

        stage = SyncStage::Transform;
        tracing::debug!("Mapping {} [{}]: {}", mapping.name, run_id, stage);
        let rows = self.transformer.apply(extracted.rows, &load_columns);

        stage = SyncStage::Load;
        let loaded = match mapping.mode {
            LoadMode::Append => self.loader.load_append(&load_spec, &rows).await,
            LoadMode::Upsert => {
                self.loader
                    .load_upsert(&load_spec, &rows, &mapping.primary_keys, &run_id)
                    .await
            }
        }
        .map_err(at(stage))?;

        stage = SyncStage::AdvanceWatermark;
        match (window, extracted.last_value) {
            (Window::Incremental, Some(value)) => {
                self.watermarks
                    .set(&mapping.name, &value)
                    .await
                    .map_err(at(stage))?;
                tracing::info!("Mapping {}: watermark advanced to {}", mapping.name, value);
            }
            (Window::Incremental, None) => {
                tracing::info!("Mapping {}: no new rows", mapping.name);
            }
            (Window::Backfill { .. }, _) => {}
        }

        stage = SyncStage::Done;
        tracing::debug!("Mapping {} [{}]: {}", mapping.name, run_id, stage);
        Ok(loaded)
    }

    /// Read pages until one comes back short.
    ///
    /// The first page includes `lower`; later pages start strictly after the
    /// last row of the previous page.
    async fn paginate(
        &self,
        mapping: &Mapping,
        columns: &[String],
        lower: Option<String>,
        upper: Option<String>,
    ) -> Result<Extracted> {
        let page_size = self.options.page_size;
        let mut request = PageRequest {
            table: mapping.source_table.clone(),
            columns: columns.to_vec(),
            incremental_column: mapping.incremental_column.clone(),
            lower_bound: lower,
            upper_bound: upper,
            limit: page_size,
            inclusive_lower: true,
        };

        let mut extracted = Extracted {
            rows: Vec::new(),
            pages: 0,
            last_value: None,
        };

        loop {
            let page = self.extractor.fetch_page(&request).await?;
            let count = page.len();
            extracted.pages += 1;

            if let Some(last) = page.last() {
                let cursor = last
                    .get(&mapping.incremental_column)
                    .and_then(|v| v.to_watermark())
                    .ok_or_else(|| {
                        SyncError::Source(format!(
                            "{}.{} is null on a page boundary; the cursor cannot advance",
                            mapping.source_table, mapping.incremental_column
                        ))
                    })?;
                request.lower_bound = Some(cursor.clone());
                request.inclusive_lower = false;
                extracted.last_value = Some(cursor);
            }

            extracted.rows.extend(page);
            tracing::debug!(
                "Mapping {}: page {} returned {} rows",
                mapping.name,
                extracted.pages,
                count
            );

            if count < page_size {
                break;
            }
        }

        Ok(extracted)
    }
}

/// 16 hex characters, unique per mapping run.
fn run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
