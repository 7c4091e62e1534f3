// ABOUTME: In-memory source, warehouse, and state backend used by the integration tests
// ABOUTME: Each fake records its calls and supports failure injection

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warehouse_replicator::error::{Endpoint, Result, SyncError};
use warehouse_replicator::retry::RetryPolicy;
use warehouse_replicator::schema::{CanonicalType, ColumnDescriptor, DestColumn, TableSpec};
use warehouse_replicator::source::{Extractor, PageRequest, SourceReader};
use warehouse_replicator::state::{DocumentVersion, StateBackend, WatermarkDocument, WatermarkStore};
use warehouse_replicator::sync::{EngineOptions, LoadMode, Mapping, SyncEngine};
use warehouse_replicator::value::{Record, Value};
use warehouse_replicator::warehouse::Warehouse;

/// Retry policy with millisecond backoff so failure tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: None,
        ..RetryPolicy::default()
    }
}

pub fn mapping(name: &str, table: &str, mode: LoadMode) -> Mapping {
    Mapping {
        name: name.to_string(),
        source_table: table.to_string(),
        destination_table: format!("dst_{}", table),
        incremental_column: "id".to_string(),
        mode,
        primary_keys: match mode {
            LoadMode::Upsert => vec!["id".to_string()],
            LoadMode::Append => Vec::new(),
        },
        backfill_start: None,
    }
}

pub fn row(id: i64, name: &str) -> Record {
    Record::new().with("id", id).with("name", name)
}

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub backend: Arc<MemoryBackend>,
    pub engine: SyncEngine,
}

impl Harness {
    pub fn new(source: ScriptedSource, options: EngineOptions) -> Self {
        Self::with_parts(
            Arc::new(source),
            Arc::new(MemoryWarehouse::default()),
            Arc::new(MemoryBackend::default()),
            options,
        )
    }

    pub fn with_parts(
        source: Arc<ScriptedSource>,
        warehouse: Arc<MemoryWarehouse>,
        backend: Arc<MemoryBackend>,
        options: EngineOptions,
    ) -> Self {
        let extractor = Extractor::new(source.clone(), fast_retry(3));
        let watermarks = Arc::new(WatermarkStore::with_retry(backend.clone(), fast_retry(3)));
        let engine = SyncEngine::new(extractor, warehouse.clone(), watermarks, options);
        Self {
            source,
            warehouse,
            backend,
            engine,
        }
    }

    /// Fresh engine over the same source, warehouse, and state.
    pub fn restart(&self, options: EngineOptions) -> Self {
        Self::with_parts(
            self.source.clone(),
            self.warehouse.clone(),
            self.backend.clone(),
            options,
        )
    }

    pub async fn watermark(&self, mapping: &str) -> Option<String> {
        self.engine.watermarks().get(mapping).await.unwrap()
    }
}

/// Source tables keyed by name, each with a column list and rows.
#[derive(Default)]
pub struct ScriptedSource {
    tables: Mutex<BTreeMap<String, SourceTable>>,
    failures: Mutex<VecDeque<SyncError>>,
    failure_at: Mutex<Option<(usize, SyncError)>>,
    requests: Mutex<Vec<PageRequest>>,
    fetches: AtomicUsize,
}

struct SourceTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Record>,
}

impl ScriptedSource {
    pub fn with_table(self, table: &str, columns: &[(&str, &str)], rows: Vec<Record>) -> Self {
        self.put_table(table, columns, rows);
        self
    }

    pub fn put_table(&self, table: &str, columns: &[(&str, &str)], rows: Vec<Record>) {
        let columns = columns
            .iter()
            .map(|(name, ty)| ColumnDescriptor::new(*name, *ty))
            .collect();
        self.tables
            .lock()
            .unwrap()
            .insert(table.to_string(), SourceTable { columns, rows });
    }

    pub fn push_rows(&self, table: &str, rows: Vec<Record>) {
        let mut tables = self.tables.lock().unwrap();
        tables.get_mut(table).unwrap().rows.extend(rows);
    }

    /// Errors returned, in order, by the next `fetch_page` calls.
    pub fn fail_next(&self, errors: Vec<SyncError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Error returned by the `nth` call to `fetch_page` (1-based).
    pub fn fail_fetch(&self, nth: usize, error: SyncError) {
        *self.failure_at.lock().unwrap() = Some((nth, error));
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }
}

fn compare_cursor(value: &Value, bound: &str) -> Ordering {
    match value {
        Value::Int(n) => bound
            .parse::<i64>()
            .map(|b| n.cmp(&b))
            .unwrap_or(Ordering::Greater),
        other => other
            .to_watermark()
            .map(|v| v.as_str().cmp(bound))
            .unwrap_or(Ordering::Less),
    }
}

#[async_trait]
impl SourceReader for ScriptedSource {
    fn describe(&self) -> String {
        "scripted source".to_string()
    }

    async fn discover_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SyncError::Source(format!("table {} does not exist", table)))
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>> {
        let fetch = self.fetches.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        {
            let mut failure_at = self.failure_at.lock().unwrap();
            if matches!(&*failure_at, Some((nth, _)) if *nth == fetch) {
                if let Some((_, err)) = failure_at.take() {
                    return Err(err);
                }
            }
        }
        self.requests.lock().unwrap().push(request.clone());

        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(&request.table)
            .ok_or_else(|| SyncError::Source(format!("table {} does not exist", request.table)))?;

        let mut rows: Vec<Record> = table
            .rows
            .iter()
            .filter(|r| {
                let Some(value) = r.get(&request.incremental_column) else {
                    return false;
                };
                let lower_ok = match &request.lower_bound {
                    None => true,
                    Some(bound) => match compare_cursor(value, bound) {
                        Ordering::Greater => true,
                        Ordering::Equal => request.inclusive_lower,
                        Ordering::Less => false,
                    },
                };
                let upper_ok = match &request.upper_bound {
                    None => true,
                    Some(bound) => compare_cursor(value, bound) != Ordering::Greater,
                };
                lower_ok && upper_ok
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            let key = |r: &Record| match r.get(&request.incremental_column) {
                Some(Value::Int(n)) => *n,
                _ => i64::MIN,
            };
            key(a).cmp(&key(b))
        });
        rows.truncate(request.limit);
        Ok(rows)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<(String, String)>,
    pub rows: Vec<Record>,
}

/// Warehouse with real merge semantics over in-memory tables.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    calls: Mutex<Vec<String>>,
    fail_inserts: Mutex<Option<String>>,
    fail_merge: Mutex<bool>,
}

impl MemoryWarehouse {
    pub fn create(&self, table: &str, columns: &[(&str, &str)]) {
        self.tables.lock().unwrap().insert(
            table.to_string(),
            MemoryTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn table(&self, table: &str) -> Option<MemoryTable> {
        self.tables.lock().unwrap().get(table).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.table(table).map(|t| t.rows).unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Fail every insert into a table whose name starts with `prefix`.
    pub fn fail_inserts_into(&self, prefix: Option<&str>) {
        *self.fail_inserts.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn fail_merge(&self, fail: bool) {
        *self.fail_merge.lock().unwrap() = fail;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn same_key(a: &Record, b: &Record, keys: &[String]) -> bool {
    keys.iter()
        .all(|k| a.get(k).and_then(Value::to_text) == b.get(k).and_then(Value::to_text))
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn describe(&self) -> String {
        "memory warehouse".to_string()
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<()> {
        self.record(format!("ensure_table {}", table.name));
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.name.clone()).or_insert_with(|| MemoryTable {
            columns: table
                .columns
                .iter()
                .map(|(n, t)| (n.clone(), t.as_str().to_string()))
                .collect(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn table_schema(&self, table: &str) -> Result<Vec<DestColumn>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|(n, ty)| DestColumn::new(n.clone(), ty.clone()))
                    .collect()
            })
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", table)))
    }

    async fn add_columns(&self, table: &str, columns: &[(String, CanonicalType)]) -> Result<()> {
        self.record(format!("add_columns {}", table));
        let mut tables = self.tables.lock().unwrap();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", table)))?;
        for (name, ty) in columns {
            target.columns.push((name.clone(), ty.as_str().to_string()));
        }
        Ok(())
    }

    async fn create_staging_table(&self, staging: &str, like: &str) -> Result<()> {
        self.record(format!("create_staging {}", staging));
        let mut tables = self.tables.lock().unwrap();
        let columns = tables
            .get(like)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", like)))?;
        tables.insert(
            staging.to_string(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64> {
        self.record(format!("insert {} {}", table, rows.len()));
        if let Some(prefix) = self.fail_inserts.lock().unwrap().as_deref() {
            if table.starts_with(prefix) {
                return Err(SyncError::Destination(format!("insert into {} rejected", table)));
            }
        }
        let mut tables = self.tables.lock().unwrap();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", table)))?;
        for row in rows {
            if let Some(unknown) = row.columns().find(|c| !target.columns.iter().any(|(n, _)| n == c)) {
                return Err(SyncError::Destination(format!(
                    "column {} does not exist in {}",
                    unknown, table
                )));
            }
        }
        target.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn merge(
        &self,
        target: &str,
        staging: &str,
        _columns: &[String],
        primary_keys: &[String],
    ) -> Result<u64> {
        self.record(format!("merge {} <- {}", target, staging));
        if *self.fail_merge.lock().unwrap() {
            return Err(SyncError::Destination("merge rejected".to_string()));
        }
        let mut tables = self.tables.lock().unwrap();
        let staged = tables
            .get(staging)
            .map(|t| t.rows.clone())
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", staging)))?;
        let dest = tables
            .get_mut(target)
            .ok_or_else(|| SyncError::Destination(format!("table {} not found", target)))?;
        for row in &staged {
            match dest.rows.iter_mut().find(|r| same_key(r, row, primary_keys)) {
                Some(existing) => *existing = row.clone(),
                None => dest.rows.push(row.clone()),
            }
        }
        Ok(staged.len() as u64)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.record(format!("drop {}", table));
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }
}

/// Versioned in-memory watermark document.
#[derive(Default)]
pub struct MemoryBackend {
    stored: Mutex<Option<(WatermarkDocument, u64)>>,
    fail_saves: Mutex<usize>,
    saves: AtomicUsize,
}

impl MemoryBackend {
    /// Make the next `count` saves fail with a transient error.
    pub fn fail_saves(&self, count: usize) {
        *self.fail_saves.lock().unwrap() = count;
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(AtomicOrdering::SeqCst)
    }

    pub fn document(&self) -> Option<WatermarkDocument> {
        self.stored.lock().unwrap().as_ref().map(|(d, _)| d.clone())
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load(&self) -> Result<Option<(WatermarkDocument, DocumentVersion)>> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .as_ref()
            .map(|(doc, version)| (doc.clone(), version.to_string())))
    }

    async fn save(
        &self,
        document: &WatermarkDocument,
        expected: Option<&str>,
    ) -> Result<DocumentVersion> {
        {
            let mut failures = self.fail_saves.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::transient(Endpoint::StateStore, "backend offline"));
            }
        }

        let mut stored = self.stored.lock().unwrap();
        let current = stored.as_ref().map(|(_, v)| v.to_string());
        if current.as_deref() != expected {
            return Err(SyncError::StateConflict);
        }
        let next = stored.as_ref().map(|(_, v)| v + 1).unwrap_or(1);
        *stored = Some((document.clone(), next));
        self.saves.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(next.to_string())
    }
}
