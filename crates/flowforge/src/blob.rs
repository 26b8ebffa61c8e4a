//! The Blob Repository contract (component E, spec §6.4). A default
//! in-process implementation lives here; `flowforge-blob` provides a
//! content-addressed local filesystem backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Discriminates a genuine [`Blob`] leaf from any other object an action
/// happens to produce. Serializes to a single fixed string; an object
/// missing the tag, or carrying a different value under it, is never a
/// blob, no matter what other fields it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum BlobTag {
    #[serde(rename = "flowforge.blob")]
    V1,
}

/// A content-addressed reference to stored bytes: the id is the hex SHA-256
/// digest of the content. Identified nominally via `tag`, not by shape —
/// see [`contains_expired_blobs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "$type")]
    tag: BlobTag,
    pub id: String,
    pub ext: Option<String>,
    pub namespace: Option<String>,
}

impl Blob {
    pub fn new(id: String, ext: Option<String>, namespace: Option<String>) -> Self {
        Self { tag: BlobTag::V1, id, ext, namespace }
    }

    pub fn id_for(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        hex::encode(digest)
    }
}

#[async_trait]
pub trait BlobRepository: Send + Sync {
    async fn save(
        &self,
        bytes: Vec<u8>,
        ext: Option<String>,
        namespace: Option<String>,
    ) -> Result<Blob>;

    async fn retrieve(&self, blob: &Blob) -> Result<Vec<u8>>;

    async fn multi_retrieve(&self, blobs: &[Blob]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(blobs.len());
        for blob in blobs {
            out.push(self.retrieve(blob).await?);
        }
        Ok(out)
    }

    async fn exists(&self, blob: &Blob) -> Result<bool>;

    /// Materialises a blob's bytes at a local filesystem path, caching the
    /// download per engine instance so repeated requests don't re-fetch.
    async fn download(&self, blob: &Blob) -> Result<PathBuf>;

    /// Test-only: permanently removes a blob, used to simulate expiry.
    async fn delete(&self, blob: &Blob) -> Result<()>;
}

/// The default, process-local [`BlobRepository`] used when a facade is not
/// configured with a persistent backend.
#[derive(Default)]
pub struct InMemoryBlobRepository {
    store: Mutex<HashMap<String, Vec<u8>>>,
    downloads: Mutex<HashMap<String, PathBuf>>,
    download_dir: Option<PathBuf>,
}

impl InMemoryBlobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_download_dir(download_dir: PathBuf) -> Self {
        Self { download_dir: Some(download_dir), ..Default::default() }
    }
}

#[async_trait]
impl BlobRepository for InMemoryBlobRepository {
    async fn save(
        &self,
        bytes: Vec<u8>,
        ext: Option<String>,
        namespace: Option<String>,
    ) -> Result<Blob> {
        let id = Blob::id_for(&bytes);
        self.store.lock().insert(id.clone(), bytes);
        Ok(Blob::new(id, ext, namespace))
    }

    async fn retrieve(&self, blob: &Blob) -> Result<Vec<u8>> {
        self.store
            .lock()
            .get(&blob.id)
            .cloned()
            .ok_or_else(|| crate::error::Error::BlobBackendError(format!("no such blob: {}", blob.id)))
    }

    async fn exists(&self, blob: &Blob) -> Result<bool> {
        Ok(self.store.lock().contains_key(&blob.id))
    }

    async fn download(&self, blob: &Blob) -> Result<PathBuf> {
        if let Some(existing) = self.downloads.lock().get(&blob.id) {
            return Ok(existing.clone());
        }
        let bytes = self.retrieve(blob).await?;
        let dir = self
            .download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)?;
        let filename = match &blob.ext {
            Some(ext) => format!("{}.{}", blob.id, ext),
            None => blob.id.clone(),
        };
        let path = dir.join(filename);
        std::fs::write(&path, bytes)?;
        self.downloads.lock().insert(blob.id.clone(), path.clone());
        Ok(path)
    }

    async fn delete(&self, blob: &Blob) -> Result<()> {
        self.store.lock().remove(&blob.id);
        self.downloads.lock().remove(&blob.id);
        Ok(())
    }
}

/// Walks an outputs value tree looking for blob leaves, identified by the
/// `$type` tag written by [`Blob`]'s `Serialize` impl rather than by shape,
/// and reports whether any of them no longer exist. An object with a
/// coincidentally blob-like shape (say, a string `id` field) but without
/// the tag is not a blob and is instead recursed into. Used by the
/// scheduler's cache-probe path before trusting a cache hit.
pub async fn contains_expired_blobs(
    repo: &Arc<dyn BlobRepository>,
    value: &serde_json::Value,
) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            if let Ok(blob) = serde_json::from_value::<Blob>(value.clone()) {
                return match repo.exists(&blob).await {
                    Ok(exists) => !exists,
                    Err(_) => true,
                };
            }
            for field in map.values() {
                if Box::pin(contains_expired_blobs(repo, field)).await {
                    return true;
                }
            }
            false
        }
        serde_json::Value::Array(items) => {
            for item in items {
                if Box::pin(contains_expired_blobs(repo, item)).await {
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}
