// ABOUTME: Extractor - column discovery and watermark-bounded page reads with retry
// ABOUTME: The SourceReader trait is the seam between the engine and a concrete database

pub mod mysql;

pub use mysql::{MySqlParams, MySqlReader};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Endpoint, Result, SyncError};
use crate::retry::RetryPolicy;
use crate::schema::ColumnDescriptor;
use crate::utils::validate_identifier;
use crate::value::Record;

/// One ordered, bounded read of the incremental column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub table: String,
    pub columns: Vec<String>,
    pub incremental_column: String,
    /// No lower bound reads from the start of the table.
    pub lower_bound: Option<String>,
    /// Always inclusive when present.
    pub upper_bound: Option<String>,
    pub limit: usize,
    /// `>=` on the first page of a run, `>` afterwards.
    pub inclusive_lower: bool,
}

/// Raw access to a source database.
///
/// Implementations perform exactly one attempt per call and report
/// retryable failures as [`SyncError::Transient`]; retrying is the
/// [`Extractor`]'s job.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn describe(&self) -> String;

    /// Columns of `table` in ordinal order.
    async fn discover_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    /// At most `request.limit` rows ordered ascending by the incremental column.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>>;
}

/// Retrying front of a [`SourceReader`].
pub struct Extractor {
    reader: Arc<dyn SourceReader>,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(reader: Arc<dyn SourceReader>, retry: RetryPolicy) -> Self {
        Self { reader, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Discover the column set of `table`.
    ///
    /// Fails with [`SyncError::Unavailable`] once transient errors exhaust
    /// the retry policy.
    pub async fn discover_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        validate_identifier(table)?;
        let what = format!("Discover columns of {}", table);
        let columns = self
            .retry
            .run(Endpoint::Source, &what, || self.reader.discover_columns(table))
            .await?;

        tracing::debug!(
            "Discovered {} column(s) on {} from {}",
            columns.len(),
            table,
            self.reader.describe()
        );
        Ok(columns)
    }

    /// Fetch one page.
    ///
    /// # Arguments
    ///
    /// * `request` - table, projected columns, cursor column, bounds, and limit
    ///
    /// # Returns
    ///
    /// Up to `request.limit` records ordered ascending by the cursor column.
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>> {
        if request.limit == 0 {
            return Err(SyncError::Config("page size must be positive".to_string()));
        }
        validate_identifier(&request.table)?;
        validate_identifier(&request.incremental_column)?;
        for column in &request.columns {
            validate_identifier(column)?;
        }

        let what = format!("Fetch page from {}", request.table);
        self.retry
            .run(Endpoint::Source, &what, || self.reader.fetch_page(request))
            .await
    }
}
