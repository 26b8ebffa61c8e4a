//! Redis-backed [`CacheRepository`], sharing results across engine
//! instances and processes. Grounded on `asyncflows.repos.cache_repo.RedisCacheRepo`:
//! every operation is wrapped in a 5-second timeout and retried up to 3
//! times with exponential backoff before being treated as a backend error.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::warn;

use flowforge::cache::{effective_key, CacheRepository};
use flowforge::error::{Error as FlowForgeError, Result};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: usize = 3;

fn backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(200).max_delay(Duration::from_secs(5)).take(MAX_ATTEMPTS)
}

pub struct RedisCacheRepository {
    client: redis::Client,
}

impl RedisCacheRepository {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| FlowForgeError::CacheBackendError(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl CacheRepository for RedisCacheRepository {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        version: Option<i64>,
        latest_mtime: i64,
        expire_seconds: Option<u64>,
    ) -> Result<()> {
        let full_key = format!("{namespace}:{}", effective_key(key, version, latest_mtime));
        let result = Retry::spawn(backoff(), || async {
            let mut conn = self.connection().await?;
            let op = async {
                match expire_seconds {
                    Some(secs) => conn.set_ex::<_, _, ()>(&full_key, value.clone(), secs).await,
                    None => conn.set::<_, _, ()>(&full_key, value.clone()).await,
                }
            };
            tokio::time::timeout(OPERATION_TIMEOUT, op)
                .await
                .map_err(|_| redis::RedisError::from((redis::ErrorKind::IoError, "operation timed out")))?
        })
        .await;

        result.map_err(|e| {
            warn!(error = %e, namespace, "redis cache store failed");
            FlowForgeError::CacheBackendError(e.to_string())
        })
    }

    async fn retrieve(
        &self,
        namespace: &str,
        key: &str,
        version: Option<i64>,
        latest_mtime: i64,
    ) -> Result<Option<Vec<u8>>> {
        let full_key = format!("{namespace}:{}", effective_key(key, version, latest_mtime));
        let result = Retry::spawn(backoff(), || async {
            let mut conn = self.connection().await?;
            let op = conn.get::<_, Option<Vec<u8>>>(&full_key);
            tokio::time::timeout(OPERATION_TIMEOUT, op)
                .await
                .map_err(|_| redis::RedisError::from((redis::ErrorKind::IoError, "operation timed out")))?
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(error = %e, namespace, "redis cache retrieve failed, treating as miss");
                Ok(None)
            }
        }
    }
}
