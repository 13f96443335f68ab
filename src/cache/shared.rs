//! Redis-backed result cache shared by every instance

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{hash_number, CacheStats, CachedOutcome, ResultCache};
use crate::error::Result;
use crate::models::{LookupOutcome, PhoneNumber, Provider};

/// Redis cache client
///
/// Keys look like `{prefix}:{provider}:{sha256(number)}`; expiry is left to
/// Redis `SET EX`. Hit/miss counters are local to this process.
pub struct RedisCache {
    pool: Pool,
    key_prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    /// Create a cache on top of an existing connection pool
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Key Generation
    // =========================================================================

    /// Generate cache key for a lookup result
    pub fn key(&self, number: &PhoneNumber, provider: Provider) -> String {
        format!("{}:{}:{}", self.key_prefix, provider, hash_number(number))
    }

    /// Check if cache is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let result: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(result == "PONG")
    }
}

#[async_trait]
impl ResultCache for RedisCache {
    async fn get(&self, number: &PhoneNumber, provider: Provider) -> Result<Option<LookupOutcome>> {
        let key = self.key(number, provider);
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(&key).await?;

        let decoded = match value {
            Some(bytes) => match serde_json::from_slice::<CachedOutcome>(&bytes) {
                Ok(cached) => Some(cached.outcome),
                Err(e) => {
                    // Treat undecodable entries as absent; the next put overwrites them
                    warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            None => None,
        };

        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(decoded)
    }

    async fn put(
        &self,
        number: &PhoneNumber,
        provider: Provider,
        outcome: &LookupOutcome,
        ttl: Duration,
    ) -> Result<()> {
        let cached = CachedOutcome {
            outcome: outcome.clone(),
            cached_at: chrono::Utc::now().timestamp(),
        };
        let bytes = serde_json::to_vec(&cached)?;
        let mut conn = self.pool.get().await?;

        // SET EX rejects zero
        conn.set_ex::<_, _, ()>(self.key(number, provider), bytes, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<u64> {
        let pattern = format!("{}:*", self.key_prefix);
        let mut conn = self.pool.get().await?;

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut *conn)
            .await?;

        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);

        if keys.is_empty() {
            debug!(pattern = %pattern, "No cache entries to invalidate");
            return Ok(0);
        }

        let count = keys.len() as u64;
        let _: () = conn.del(keys).await?;

        info!(pattern = %pattern, count, "Invalidated cache entries");
        Ok(count)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
