// ABOUTME: Local-file watermark backend with content-hash versions
// ABOUTME: Writes land in a sibling temp file that is atomically renamed over the target

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};

use super::{DocumentVersion, StateBackend, WatermarkDocument};

/// Watermark document stored as a JSON file.
///
/// The version is the SHA-256 of the file contents. The version check and
/// the rename are not one atomic step, so two processes racing on the same
/// file within that window can still overwrite each other.
pub struct LocalFileBackend {
    path: PathBuf,
}

impl LocalFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_current(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::State(format!(
                "Failed to read watermark file {:?}: {}",
                self.path, e
            ))),
        }
    }
}

fn content_version(bytes: &[u8]) -> DocumentVersion {
    format!("{:x}", Sha256::digest(bytes))
}

#[async_trait]
impl StateBackend for LocalFileBackend {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn load(&self) -> Result<Option<(WatermarkDocument, DocumentVersion)>> {
        let Some(bytes) = self.read_current().await? else {
            return Ok(None);
        };
        let document = WatermarkDocument::from_bytes(&bytes).map_err(|e| {
            SyncError::State(format!("Failed to parse watermark file {:?}: {}", self.path, e))
        })?;
        Ok(Some((document, content_version(&bytes))))
    }

    async fn save(
        &self,
        document: &WatermarkDocument,
        expected: Option<&str>,
    ) -> Result<DocumentVersion> {
        let current = self.read_current().await?.map(|b| content_version(&b));
        if current.as_deref() != expected {
            return Err(SyncError::StateConflict);
        }

        let bytes = document.to_bytes()?;
        let version = content_version(&bytes);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| SyncError::State(format!("Watermark write task failed: {}", e)))??;

        Ok(version)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        SyncError::State(format!("Failed to replace watermark file {:?}: {}", path, e))
    })?;
    Ok(())
}
