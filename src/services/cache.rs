use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::recipe::{CachedExtraction, ExtractionResult};
use crate::services::idempotency::source_hash;

const CACHE_KEY_PREFIX: &str = "recipe_extract:cache";

/// Memoized extraction results keyed by normalized source URL.
///
/// The orchestrator only reads and upserts; eviction belongs to the store.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get_by_normalized_source(
        &self,
        normalized_url: &str,
    ) -> Result<Option<CachedExtraction>, CacheError>;

    async fn set(&self, normalized_url: &str, payload: &ExtractionResult) -> Result<(), CacheError>;

    async fn increment_hit_count(&self, source_hash: &str) -> Result<(), CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Redis-backed [`ResultCache`]: one hash per source with `payload`, `hits` and `cached_at`.
pub struct RedisResultCache {
    client: redis::Client,
    ttl: Duration,
}

impl RedisResultCache {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl })
    }

    fn key(hash: &str) -> String {
        format!("{CACHE_KEY_PREFIX}:{hash}")
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get_by_normalized_source(
        &self,
        normalized_url: &str,
    ) -> Result<Option<CachedExtraction>, CacheError> {
        let hash = source_hash(normalized_url);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(Self::key(&hash)).await?;

        let Some(payload) = fields.get("payload") else {
            return Ok(None);
        };
        let payload: ExtractionResult = serde_json::from_str(payload)?;
        let hit_count = fields
            .get("hits")
            .and_then(|h| h.parse().ok())
            .unwrap_or(0);
        let cached_at = fields
            .get("cached_at")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(CachedExtraction {
            source_hash: hash,
            payload,
            hit_count,
            cached_at,
        }))
    }

    async fn set(&self, normalized_url: &str, payload: &ExtractionResult) -> Result<(), CacheError> {
        let key = Self::key(&source_hash(normalized_url));
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Upsert keeps an existing hit counter.
        let () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("payload")
            .arg(payload)
            .arg("cached_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("HSETNX")
            .arg(&key)
            .arg("hits")
            .arg(0)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment_hit_count(&self, source_hash: &str) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // Never resurrect an evicted entry as a payload-less key without a TTL.
        let script = redis::Script::new(
            "if redis.call('EXISTS', KEYS[1]) == 1 then \
                return redis.call('HINCRBY', KEYS[1], 'hits', 1) \
             end \
             return 0",
        );
        let _hits: i64 = script
            .key(Self::key(source_hash))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
