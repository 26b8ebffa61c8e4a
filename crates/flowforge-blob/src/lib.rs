//! Content-addressed local filesystem [`BlobRepository`] (spec §6.4).
//! Every blob is stored and retrieved by the SHA-256 hex digest of its
//! bytes, already computed by [`flowforge::blob::Blob::id_for`]; this crate
//! only adds the on-disk layout, atomic writes, and a per-repository
//! download cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use flowforge::blob::{Blob, BlobRepository};
use flowforge::error::{Error as FlowForgeError, Result};

/// Stores blobs under `<directory>/<namespace-or-"_default">/<id>[.<ext>]`.
pub struct FsBlobRepository {
    directory: PathBuf,
    downloads: Mutex<HashMap<String, PathBuf>>,
}

impl FsBlobRepository {
    pub fn new(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory, downloads: Mutex::new(HashMap::new()) })
    }

    /// Uses the platform data directory (`$XDG_DATA_HOME/flowforge/blobs` or
    /// equivalent) when no explicit directory is configured.
    pub fn default_location() -> std::io::Result<Self> {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("flowforge").join("blobs"))
    }

    fn namespace_dir(&self, namespace: Option<&str>) -> PathBuf {
        self.directory.join(namespace.unwrap_or("_default"))
    }

    fn blob_path(&self, blob: &Blob) -> PathBuf {
        let filename = match &blob.ext {
            Some(ext) => format!("{}.{}", blob.id, ext),
            None => blob.id.clone(),
        };
        self.namespace_dir(blob.namespace.as_deref()).join(filename)
    }

    async fn atomic_write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("blob"),
            uuid::Uuid::new_v4()
        );
        let temp_path = path.with_file_name(temp_name);
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobRepository for FsBlobRepository {
    async fn save(&self, bytes: Vec<u8>, ext: Option<String>, namespace: Option<String>) -> Result<Blob> {
        let blob = Blob::new(Blob::id_for(&bytes), ext, namespace);
        let path = self.blob_path(&blob);
        self.atomic_write(&path, &bytes)
            .await
            .map_err(|e| FlowForgeError::BlobBackendError(e.to_string()))?;
        Ok(blob)
    }

    async fn retrieve(&self, blob: &Blob) -> Result<Vec<u8>> {
        let path = self.blob_path(blob);
        tokio::fs::read(&path)
            .await
            .map_err(|e| FlowForgeError::BlobBackendError(format!("{}: {e}", blob.id)))
    }

    async fn exists(&self, blob: &Blob) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(blob)).await.unwrap_or(false))
    }

    async fn download(&self, blob: &Blob) -> Result<PathBuf> {
        if let Some(cached) = self.downloads.lock().get(&blob.id).cloned() {
            return Ok(cached);
        }
        let path = self.blob_path(blob);
        if !self.exists(blob).await? {
            return Err(FlowForgeError::BlobBackendError(format!("no such blob: {}", blob.id)));
        }
        self.downloads.lock().insert(blob.id.clone(), path.clone());
        Ok(path)
    }

    async fn delete(&self, blob: &Blob) -> Result<()> {
        let path = self.blob_path(blob);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(error = %e, id = %blob.id, "failed to delete blob");
                return Err(FlowForgeError::BlobBackendError(e.to_string()));
            }
        }
        self.downloads.lock().remove(&blob.id);
        Ok(())
    }
}

/// Shared-pointer constructor convenience, since the facade always stores a
/// blob repository behind an `Arc<dyn BlobRepository>`.
pub fn shared(repo: FsBlobRepository) -> Arc<dyn BlobRepository> {
    Arc::new(repo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsBlobRepository::new(dir.path()).unwrap();
        let blob = repo.save(b"hello".to_vec(), Some("txt".to_string()), None).await.unwrap();
        assert!(repo.exists(&blob).await.unwrap());
        let bytes = repo.retrieve(&blob).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn delete_marks_blob_as_expired() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsBlobRepository::new(dir.path()).unwrap();
        let blob = repo.save(b"hello".to_vec(), None, Some("ns".to_string())).await.unwrap();
        repo.delete(&blob).await.unwrap();
        assert!(!repo.exists(&blob).await.unwrap());
    }
}
