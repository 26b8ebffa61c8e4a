//! On-disk [`CacheRepository`] backend (spec §6.3's "on-disk key-value
//! file" implementation). Grounded on the teacher's checkpoint file format:
//! a short magic/checksum/length header wraps every entry so a partially
//! written or corrupted file is detected as a miss rather than silently
//! returning bad bytes, and writes land via temp-file-then-rename so a
//! crash mid-write never corrupts an existing entry.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use flowforge::cache::{effective_key, CacheRepository};
use flowforge::error::{Error as FlowForgeError, Result};

const MAGIC: &[u8; 4] = b"FFCH";
const FORMAT_VERSION: u32 = 1;
// magic(4) + version(4) + crc32(4) + expires_at(8) + length(8)
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8;

#[derive(Debug, Error)]
pub enum FsCacheError {
    #[error("cache file too small: {size} bytes (minimum {minimum})")]
    FileTooSmall { size: usize, minimum: usize },
    #[error("cache file has an unrecognised header")]
    InvalidMagic,
    #[error("cache file format version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("cache entry declared length {declared} does not match actual {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("cache entry checksum mismatch: expected {expected:x}, computed {computed:x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FsCacheError> for FlowForgeError {
    fn from(e: FsCacheError) -> Self {
        FlowForgeError::CacheBackendError(e.to_string())
    }
}

fn wrap(payload: &[u8], expires_at: Option<u64>) -> Vec<u8> {
    let checksum = crc32fast::hash(payload);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&expires_at.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn unwrap(data: &[u8]) -> std::result::Result<(Vec<u8>, Option<u64>), FsCacheError> {
    if data.len() < HEADER_SIZE {
        return Err(FsCacheError::FileTooSmall { size: data.len(), minimum: HEADER_SIZE });
    }
    if &data[0..4] != MAGIC {
        return Err(FsCacheError::InvalidMagic);
    }
    let version = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice"));
    if version > FORMAT_VERSION {
        return Err(FsCacheError::UnsupportedVersion { found: version, supported: FORMAT_VERSION });
    }
    let checksum = u32::from_le_bytes(data[8..12].try_into().expect("4-byte slice"));
    let expires_at = u64::from_le_bytes(data[12..20].try_into().expect("8-byte slice"));
    let declared_length = u64::from_le_bytes(data[20..28].try_into().expect("8-byte slice"));
    let payload = &data[HEADER_SIZE..];
    let actual_length = payload.len() as u64;
    if declared_length != actual_length {
        return Err(FsCacheError::LengthMismatch { declared: declared_length, actual: actual_length });
    }
    let computed = crc32fast::hash(payload);
    if computed != checksum {
        return Err(FsCacheError::ChecksumMismatch { expected: checksum, computed });
    }
    Ok((payload.to_vec(), if expires_at == 0 { None } else { Some(expires_at) }))
}

fn lock_file_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

/// Holds an exclusive, advisory filesystem lock on `path`'s sibling `.lock`
/// file for the duration of a write, so two producers racing to cache the
/// same key never interleave their writes into the same temp/rename pair.
fn acquire_exclusive_lock(path: &Path) -> std::io::Result<std::fs::File> {
    let lock_path = lock_file_path(path);
    let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(lock_path)?;
    fs2::FileExt::lock_exclusive(&file)?;
    Ok(file)
}

async fn atomic_write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let data = data.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let _lock = acquire_exclusive_lock(&path)?;
        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("entry"),
            uuid::Uuid::new_v4()
        );
        let temp_path = path.with_file_name(temp_name);
        std::fs::write(&temp_path, &data)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A process-local, filesystem-persisted [`CacheRepository`]. Every entry
/// lives under `directory` as a file named by the SHA-256 hex digest of its
/// namespaced effective key, avoiding any filesystem-unsafe characters.
pub struct FsCacheRepository {
    directory: PathBuf,
}

impl FsCacheRepository {
    pub fn new(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn entry_path(&self, namespace: &str, key: &str, version: Option<i64>, latest_mtime: i64) -> PathBuf {
        let full_key = format!("{namespace}:{}", effective_key(key, version, latest_mtime));
        let digest = Sha256::digest(full_key.as_bytes());
        self.directory.join(hex::encode(digest))
    }
}

#[async_trait]
impl CacheRepository for FsCacheRepository {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        version: Option<i64>,
        latest_mtime: i64,
        expire_seconds: Option<u64>,
    ) -> Result<()> {
        let path = self.entry_path(namespace, key, version, latest_mtime);
        let expires_at = expire_seconds.map(|secs| now_secs() + secs);
        let wrapped = wrap(&value, expires_at);
        atomic_write_file(&path, &wrapped)
            .await
            .map_err(|e| FlowForgeError::CacheBackendError(e.to_string()))
    }

    async fn retrieve(
        &self,
        namespace: &str,
        key: &str,
        version: Option<i64>,
        latest_mtime: i64,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(namespace, key, version, latest_mtime);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(error = %e, "cache file read error, treating as miss");
                return Ok(None);
            }
        };
        match unwrap(&bytes) {
            Ok((payload, Some(expires_at))) if expires_at <= now_secs() => {
                let _ = tokio::fs::remove_file(&path).await;
                let _ = payload;
                Ok(None)
            }
            Ok((payload, _)) => Ok(Some(payload)),
            Err(e) => {
                warn!(error = %e, "cache entry failed integrity check, treating as miss");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsCacheRepository::new(dir.path()).unwrap();
        repo.store("add", "k1", b"hello".to_vec(), Some(1), 0, None).await.unwrap();
        let hit = repo.retrieve("add", "k1", Some(1), 0).await.unwrap();
        assert_eq!(hit, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn detects_corrupted_entries_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsCacheRepository::new(dir.path()).unwrap();
        repo.store("add", "k1", b"hello".to_vec(), Some(1), 0, None).await.unwrap();
        let path = repo.entry_path("add", "k1", Some(1), 0);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        tokio::fs::write(&path, bytes).await.unwrap();
        let hit = repo.retrieve("add", "k1", Some(1), 0).await.unwrap();
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsCacheRepository::new(dir.path()).unwrap();
        repo.store("add", "k1", b"hello".to_vec(), Some(1), 0, Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let hit = repo.retrieve("add", "k1", Some(1), 0).await.unwrap();
        assert_eq!(hit, None);
    }
}
