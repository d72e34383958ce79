//! Read-through cache for expensive read paths.
//!
//! The cache is never allowed to fail a request: every backend error is
//! logged and the caller falls through to the producer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw key/value operations the cache needs from its backend.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Redis-backed cache. `ConnectionManager` reconnects on its own and is cheap to clone.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(client: redis::Client) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached value for `key`, or runs `producer` and caches its result.
    ///
    /// Results that serialize to `null` are returned but not stored. Backend
    /// failures on read or write degrade to the producer's fresh value; only
    /// the producer's own error reaches the caller.
    pub async fn get_cached<T, E, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    metrics::counter!("streamify_cache_hits_total").increment(1);
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                }
            },
            Ok(None) => {}
            Err(e) => {
                metrics::counter!("streamify_cache_errors_total", "op" => "get").increment(1);
                tracing::warn!(key, error = %e, "cache read failed, falling back to source");
            }
        }

        metrics::counter!("streamify_cache_misses_total").increment(1);
        let value = producer().await?;

        match serde_json::to_value(&value) {
            Ok(serde_json::Value::Null) => {}
            Ok(json) => {
                if let Err(e) = self.backend.set(key, json.to_string(), ttl).await {
                    metrics::counter!("streamify_cache_errors_total", "op" => "set").increment(1);
                    tracing::warn!(key, error = %e, "cache write failed");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "value not cacheable"),
        }

        Ok(value)
    }

    pub async fn invalidate(&self, key: &str) {
        match self.backend.delete(key).await {
            Ok(()) => tracing::debug!(key, "cache key invalidated"),
            Err(e) => {
                metrics::counter!("streamify_cache_errors_total", "op" => "delete").increment(1);
                tracing::warn!(key, error = %e, "cache invalidation failed");
            }
        }
    }

    pub async fn invalidate_all(&self, keys: &[String]) {
        for key in keys {
            self.invalidate(key).await;
        }
    }
}

pub mod keys {
    use uuid::Uuid;

    use crate::store::FeedQuery;

    pub fn feed(query: &FeedQuery) -> String {
        format!(
            "videos:feed:page={}:limit={}:query={}:sortBy={}:sortType={}",
            query.page,
            query.limit,
            query.query.as_deref().unwrap_or(""),
            query.sort_by.as_str(),
            query.sort_type.as_str(),
        )
    }

    /// The one feed key writes invalidate. Other pages age out with their TTL.
    pub fn feed_first_page() -> String {
        feed(&FeedQuery::default())
    }

    pub fn video(id: Uuid) -> String {
        format!("videos:id:{}", id)
    }

    /// Keys touched by any write to `id`.
    pub fn for_video_write(id: Uuid) -> Vec<String> {
        vec![video(id), feed_first_page()]
    }
}
