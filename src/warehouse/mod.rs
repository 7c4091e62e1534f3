// ABOUTME: Destination warehouse contract and the loader built on top of it
// ABOUTME: Exposes the PostgreSQL-compatible implementation and staging-table naming

pub mod loader;
pub mod postgres;

pub use loader::{staging_table_name, Loader};
pub use postgres::PostgresWarehouse;

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::{CanonicalType, DestColumn, TableSpec};
use crate::value::Record;

/// Primitive operations the loader composes into append and upsert loads.
///
/// Table names are unqualified; the implementation resolves them within its
/// configured dataset. Implementations must be `Send + Sync` for use behind
/// `Arc<dyn Warehouse>`.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Human-readable identity for logs (credentials masked).
    fn describe(&self) -> String;

    /// Create the table with the given columns if it does not exist yet.
    async fn ensure_table(&self, table: &TableSpec) -> Result<()>;

    /// Live schema of a table, in column order.
    async fn table_schema(&self, table: &str) -> Result<Vec<DestColumn>>;

    /// Append nullable columns to an existing table.
    async fn add_columns(&self, table: &str, columns: &[(String, CanonicalType)]) -> Result<()>;

    /// Create an empty table shaped like `like`, replacing any table named `staging`.
    async fn create_staging_table(&self, staging: &str, like: &str) -> Result<()>;

    /// Insert rows as one all-or-nothing job. All rows share the first row's columns.
    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64>;

    /// Merge `staging` into `target` keyed on `primary_keys`: update every
    /// non-key column on match, insert the full row otherwise.
    async fn merge(
        &self,
        target: &str,
        staging: &str,
        columns: &[String],
        primary_keys: &[String],
    ) -> Result<u64>;

    /// Drop a table if it exists.
    async fn drop_table(&self, table: &str) -> Result<()>;
}
