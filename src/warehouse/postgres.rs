// ABOUTME: PostgreSQL-compatible warehouse - DDL, batched text-cast inserts, and MERGE from staging
// ABOUTME: The dataset is a schema; native column types are translated back to canonical names

use std::collections::HashMap;

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::error::{Endpoint, Result, SyncError};
use crate::retry::RetryPolicy;
use crate::schema::{CanonicalType, DestColumn, TableSpec};
use crate::utils::{quote_ident, sanitize_url, validate_identifier};
use crate::value::Record;

use super::Warehouse;

/// Bind parameters per statement; the protocol limit is 65535.
const MAX_PARAMS: usize = 65000;

/// Warehouse backed by a PostgreSQL-compatible server.
///
/// A single connection is shared behind a mutex because inserts run inside
/// a transaction, which needs exclusive access to the client.
pub struct PostgresWarehouse {
    client: Mutex<Client>,
    dataset: String,
    display_url: String,
}

impl PostgresWarehouse {
    /// Connect to the warehouse and make sure the dataset schema exists.
    ///
    /// The connection attempt is retried with `retry`; an unknown host or a
    /// dropped socket is transient, an authentication failure is not.
    pub async fn connect(url: &str, dataset: &str, retry: &RetryPolicy) -> Result<Self> {
        validate_identifier(dataset)?;
        let display_url = sanitize_url(url);

        tracing::info!("Connecting to warehouse {}", display_url);
        let client = retry
            .run(Endpoint::Destination, "Connect to warehouse", || {
                connect_client(url)
            })
            .await?;

        client
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset)))
            .await
            .map_err(|e| classify(e, &format!("Failed to create dataset {}", dataset)))?;

        Ok(Self {
            client: Mutex::new(client),
            dataset: dataset.to_string(),
            display_url,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    fn qualified(&self, table: &str) -> String {
        qualified_name(&self.dataset, table)
    }

    /// Native column types of a table as reported by `format_type`, in order.
    async fn native_columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT a.attname, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 WHERE a.attrelid = to_regclass($1::text)
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&self.qualified(table)],
            )
            .await
            .map_err(|e| classify(e, &format!("Failed to read schema of {}", table)))?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let dtype: String = row.get(1);
                (name, dtype)
            })
            .collect())
    }

    async fn execute_ddl(&self, sql: &str, what: &str) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| classify(e, what))
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn describe(&self) -> String {
        format!("{} (dataset {})", self.display_url, self.dataset)
    }

    async fn ensure_table(&self, table: &TableSpec) -> Result<()> {
        validate_identifier(&table.name)?;
        let sql = build_create_table_query(&self.dataset, table);
        self.execute_ddl(&sql, &format!("Failed to create table {}", table.name))
            .await
    }

    async fn table_schema(&self, table: &str) -> Result<Vec<DestColumn>> {
        Ok(self
            .native_columns(table)
            .await?
            .into_iter()
            .map(|(name, native)| DestColumn::new(name, native_to_canonical(&native)))
            .collect())
    }

    async fn add_columns(&self, table: &str, columns: &[(String, CanonicalType)]) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let sql = build_add_columns_query(&self.dataset, table, columns);
        self.execute_ddl(&sql, &format!("Failed to add columns to {}", table))
            .await
    }

    async fn create_staging_table(&self, staging: &str, like: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {staging}; CREATE TABLE {staging} (LIKE {like} INCLUDING DEFAULTS)",
            staging = self.qualified(staging),
            like = self.qualified(like),
        );
        self.execute_ddl(&sql, &format!("Failed to create staging table {}", staging))
            .await
    }

    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns: Vec<String> = rows[0].columns().map(str::to_string).collect();
        let native: HashMap<String, String> = self.native_columns(table).await?.into_iter().collect();
        let mut types = Vec::with_capacity(columns.len());
        for column in &columns {
            let native_type = native.get(column).ok_or_else(|| {
                SyncError::Destination(format!(
                    "column {} does not exist in {}.{}",
                    column, self.dataset, table
                ))
            })?;
            types.push(native_type.clone());
        }

        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify(e, "Failed to begin load transaction"))?;

        let mut total = 0u64;
        for chunk in rows.chunks(batch_size) {
            let query = build_insert_query(&self.dataset, table, &columns, &types, chunk.len());
            let values: Vec<Option<String>> = chunk
                .iter()
                .flat_map(|row| {
                    columns
                        .iter()
                        .map(move |c| row.get(c).and_then(|v| v.to_text()))
                })
                .collect();
            let params: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

            total += tx
                .execute(&query, &params)
                .await
                .map_err(|e| classify(e, &format!("Failed to load batch into {}", table)))?;
        }

        tx.commit()
            .await
            .map_err(|e| classify(e, &format!("Failed to commit load into {}", table)))?;

        Ok(total)
    }

    async fn merge(
        &self,
        target: &str,
        staging: &str,
        columns: &[String],
        primary_keys: &[String],
    ) -> Result<u64> {
        let query = build_merge_query(&self.dataset, target, staging, columns, primary_keys);
        let client = self.client.lock().await;
        client
            .execute(&query, &[])
            .await
            .map_err(|e| classify(e, &format!("Failed to merge {} into {}", staging, target)))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.qualified(table));
        self.execute_ddl(&sql, &format!("Failed to drop table {}", table))
            .await
    }
}

async fn connect_client(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .build()
        .map_err(|e| SyncError::Config(format!("Failed to build TLS connector: {}", e)))?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .map_err(|e| classify(e, "Failed to connect to warehouse"))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Warehouse connection error: {}", e);
        }
    });

    Ok(client)
}

/// Turn a driver error into a typed error.
///
/// Errors without a SQLSTATE come from the socket or protocol layer and are
/// treated as transient, as are serialization failures and deadlocks.
fn classify(err: tokio_postgres::Error, what: &str) -> SyncError {
    let message = match err.as_db_error() {
        Some(db) => format!("{}: {}", what, db.message()),
        None => format!("{}: {}", what, err),
    };

    let transient = match err.code() {
        None => true,
        Some(code) => {
            *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::CONNECTION_FAILURE
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::TOO_MANY_CONNECTIONS
        }
    };

    if transient || err.is_closed() {
        SyncError::transient(Endpoint::Destination, message)
    } else {
        SyncError::Destination(message)
    }
}

fn qualified_name(dataset: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(dataset), quote_ident(table))
}

/// Native column type used when creating or evolving a table.
pub fn native_type(canonical: CanonicalType) -> &'static str {
    match canonical {
        CanonicalType::Integer => "BIGINT",
        CanonicalType::Float => "DOUBLE PRECISION",
        CanonicalType::Decimal => "NUMERIC",
        CanonicalType::String => "TEXT",
        CanonicalType::Timestamp => "TIMESTAMPTZ",
        CanonicalType::Date => "DATE",
        CanonicalType::Time => "TIME",
    }
}

/// Translate a `format_type` rendering to a canonical type name.
///
/// Types without a canonical counterpart are returned verbatim.
pub fn native_to_canonical(native: &str) -> String {
    let lowered = native.trim().to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "bigint" | "integer" | "smallint" => Some(CanonicalType::Integer),
        "double precision" | "real" => Some(CanonicalType::Float),
        "text" => Some(CanonicalType::String),
        "date" => Some(CanonicalType::Date),
        t if t.starts_with("numeric") => Some(CanonicalType::Decimal),
        t if t.starts_with("character") => Some(CanonicalType::String),
        t if t.starts_with("timestamp") => Some(CanonicalType::Timestamp),
        t if t.starts_with("time") => Some(CanonicalType::Time),
        _ => None,
    };

    canonical
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| native.to_string())
}

/// Build the CREATE TABLE statement for a table spec.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS "dataset"."orders" ("id" BIGINT, "updated_at" TIMESTAMPTZ)
/// ```
fn build_create_table_query(dataset: &str, table: &TableSpec) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|(name, t)| format!("{} {}", quote_ident(name), native_type(*t)))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_name(dataset, &table.name),
        columns.join(", ")
    )
}

fn build_add_columns_query(
    dataset: &str,
    table: &str,
    columns: &[(String, CanonicalType)],
) -> String {
    let additions: Vec<String> = columns
        .iter()
        .map(|(name, t)| format!("ADD COLUMN IF NOT EXISTS {} {}", quote_ident(name), native_type(*t)))
        .collect();

    format!(
        "ALTER TABLE {} {}",
        qualified_name(dataset, table),
        additions.join(", ")
    )
}

/// Build a multi-row insert where every parameter is bound as text and cast
/// to the column's native type.
///
/// ```sql
/// INSERT INTO "dataset"."orders" ("id", "name")
/// VALUES ($1::text::bigint, $2::text::text), ($3::text::bigint, $4::text::text)
/// ```
fn build_insert_query(
    dataset: &str,
    table: &str,
    columns: &[String],
    native_types: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = native_types
                .iter()
                .enumerate()
                .map(|(col_idx, t)| format!("${}::text::{}", row_idx * num_cols + col_idx + 1, t))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_name(dataset, table),
        quoted_columns.join(", "),
        value_rows.join(", ")
    )
}

/// Build the MERGE from a staging table into its target.
///
/// ```sql
/// MERGE INTO "ds"."orders" AS t USING "ds"."_orders_staging_x" AS s
/// ON t."id" = s."id"
/// WHEN MATCHED THEN UPDATE SET "status" = s."status"
/// WHEN NOT MATCHED THEN INSERT ("id", "status") VALUES (s."id", s."status")
/// ```
///
/// When every column is a key column the `WHEN MATCHED` branch is omitted.
fn build_merge_query(
    dataset: &str,
    target: &str,
    staging: &str,
    columns: &[String],
    primary_keys: &[String],
) -> String {
    let on_clause: Vec<String> = primary_keys
        .iter()
        .map(|pk| format!("t.{col} = s.{col}", col = quote_ident(pk)))
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| !primary_keys.contains(c))
        .map(|c| format!("{col} = s.{col}", col = quote_ident(c)))
        .collect();

    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let source_values: Vec<String> = quoted_columns.iter().map(|c| format!("s.{}", c)).collect();

    let matched_clause = if update_columns.is_empty() {
        String::new()
    } else {
        format!(" WHEN MATCHED THEN UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "MERGE INTO {} AS t USING {} AS s ON {}{} WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        qualified_name(dataset, target),
        qualified_name(dataset, staging),
        on_clause.join(" AND "),
        matched_clause,
        quoted_columns.join(", "),
        source_values.join(", ")
    )
}
