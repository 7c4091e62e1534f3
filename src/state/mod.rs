// ABOUTME: WatermarkStore - per-mapping last-synced values in one shared JSON document
// ABOUTME: Updates are versioned compare-and-swap writes serialized by an in-process lock

pub mod gcs;
pub mod local;

pub use gcs::GcsBackend;
pub use local::LocalFileBackend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Endpoint, Result, SyncError};
use crate::retry::RetryPolicy;

/// Attempts for one `set` when the document keeps changing underneath it.
const MAX_CONFLICT_ATTEMPTS: u32 = 5;

/// The persisted document: `{ "last_sync": { <mapping>: <watermark> } }`.
///
/// Unknown top-level keys are carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkDocument {
    #[serde(default)]
    pub last_sync: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WatermarkDocument {
    pub fn get(&self, mapping: &str) -> Option<&str> {
        self.last_sync.get(mapping).map(String::as_str)
    }

    pub fn set(&mut self, mapping: &str, value: &str) {
        self.last_sync.insert(mapping.to_string(), value.to_string());
    }

    /// Parse stored bytes. An empty or whitespace-only payload is an empty document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Pretty JSON with sorted keys.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Opaque version token of a stored document.
pub type DocumentVersion = String;

/// Storage medium for the watermark document.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
#[async_trait]
pub trait StateBackend: Send + Sync {
    fn describe(&self) -> String;

    /// Read the document and its version. `Ok(None)` when nothing is stored yet.
    async fn load(&self) -> Result<Option<(WatermarkDocument, DocumentVersion)>>;

    /// Write the document if the stored version still equals `expected`
    /// (`None` meaning "must not exist yet").
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StateConflict`] when the version moved.
    async fn save(
        &self,
        document: &WatermarkDocument,
        expected: Option<&str>,
    ) -> Result<DocumentVersion>;
}

/// Durable mapping-name to watermark store.
pub struct WatermarkStore {
    backend: Arc<dyn StateBackend>,
    retry: RetryPolicy,
    write_lock: Mutex<()>,
}

impl WatermarkStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self::with_retry(backend, RetryPolicy::default())
    }

    /// Use `retry` for transient backend failures on each load and save.
    pub fn with_retry(backend: Arc<dyn StateBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            write_lock: Mutex::new(()),
        }
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    /// Last stored watermark for `mapping`, if any.
    pub async fn get(&self, mapping: &str) -> Result<Option<String>> {
        let loaded = self.load().await?;
        Ok(loaded.and_then(|(doc, _)| doc.get(mapping).map(str::to_string)))
    }

    /// Store `value` as the watermark for `mapping`.
    ///
    /// Read-modify-write of the single key, guarded by a process-wide lock
    /// and a versioned write; a concurrent writer from another process makes
    /// the write conflict, and the update is re-applied on a fresh read.
    pub async fn set(&self, mapping: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let (mut doc, version) = match self.load().await? {
                Some((doc, version)) => (doc, Some(version)),
                None => (WatermarkDocument::default(), None),
            };
            doc.set(mapping, value);

            let what = format!("Save watermark for {}", mapping);
            let result = self
                .retry
                .run(Endpoint::StateStore, &what, || {
                    self.backend.save(&doc, version.as_deref())
                })
                .await;

            match result {
                Ok(_) => {
                    tracing::debug!("Stored watermark {}={}", mapping, value);
                    return Ok(());
                }
                Err(SyncError::StateConflict) => {
                    tracing::warn!(
                        "Watermark document changed concurrently (attempt {}/{}), re-reading",
                        attempt,
                        MAX_CONFLICT_ATTEMPTS
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::StateConflict)
    }

    /// The whole `last_sync` table.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .load()
            .await?
            .map(|(doc, _)| doc.last_sync)
            .unwrap_or_default())
    }

    async fn load(&self) -> Result<Option<(WatermarkDocument, DocumentVersion)>> {
        self.retry
            .run(Endpoint::StateStore, "Load watermark document", || {
                self.backend.load()
            })
            .await
    }
}
