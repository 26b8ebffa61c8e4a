//! The Cache Repository contract (component D, spec §6.3). An in-memory
//! default lives here; `flowforge-cache-fs` and `flowforge-cache-redis`
//! provide persistent and remote-shared backends respectively.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Composes the effective cache key: versioned when an action version is
/// pinned, otherwise qualified by the latest file-modification timestamp of
/// the project (spec §6.3, §9's "version is null" open question).
pub fn effective_key(key: &str, version: Option<i64>, latest_mtime: i64) -> String {
    match version {
        Some(v) => format!("{key}:v{v}"),
        None => format!("{key}:t{latest_mtime}"),
    }
}

#[async_trait]
pub trait CacheRepository: Send + Sync {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        version: Option<i64>,
        latest_mtime: i64,
        expire_seconds: Option<u64>,
    ) -> Result<()>;

    async fn retrieve(
        &self,
        namespace: &str,
        key: &str,
        version: Option<i64>,
        latest_mtime: i64,
    ) -> Result<Option<Vec<u8>>>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// The default, process-local [`CacheRepository`].
#[derive(Default)]
pub struct InMemoryCacheRepository {
    store: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCacheRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(namespace: &str, key: &str, version: Option<i64>, latest_mtime: i64) -> String {
        format!("{namespace}:{}", effective_key(key, version, latest_mtime))
    }
}

#[async_trait]
impl CacheRepository for InMemoryCacheRepository {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        version: Option<i64>,
        latest_mtime: i64,
        expire_seconds: Option<u64>,
    ) -> Result<()> {
        let full_key = Self::full_key(namespace, key, version, latest_mtime);
        let expires_at = expire_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.store.lock().insert(full_key, Entry { value, expires_at });
        Ok(())
    }

    async fn retrieve(
        &self,
        namespace: &str,
        key: &str,
        version: Option<i64>,
        latest_mtime: i64,
    ) -> Result<Option<Vec<u8>>> {
        let full_key = Self::full_key(namespace, key, version, latest_mtime);
        let mut store = self.store.lock();
        if let Some(entry) = store.get(&full_key) {
            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    store.remove(&full_key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_by_version() {
        let repo = InMemoryCacheRepository::new();
        repo.store("add", "k1", b"42".to_vec(), Some(1), 0, None).await.unwrap();
        let hit = repo.retrieve("add", "k1", Some(1), 0).await.unwrap();
        assert_eq!(hit, Some(b"42".to_vec()));
        let miss = repo.retrieve("add", "k1", Some(2), 0).await.unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn mtime_qualified_key_changes_on_project_change() {
        let repo = InMemoryCacheRepository::new();
        repo.store("add", "k1", b"42".to_vec(), None, 100, None).await.unwrap();
        assert_eq!(
            repo.retrieve("add", "k1", None, 100).await.unwrap(),
            Some(b"42".to_vec())
        );
        assert_eq!(repo.retrieve("add", "k1", None, 200).await.unwrap(), None);
    }
}
