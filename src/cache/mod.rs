//! Result cache keyed by (normalized number, provider)
//!
//! Entries expire lazily: a `get` that finds an entry older than its TTL
//! reports a miss and drops it. Hit/miss counters are monotonic and only reset
//! by `invalidate_all`.
//!
//! # Example
//!
//! ```rust,ignore
//! use phonecheck::cache::{MemoryCache, ResultCache};
//!
//! let cache = MemoryCache::new();
//! cache.put(&number, Provider::Kaspersky, &outcome, ttl).await?;
//! let cached = cache.get(&number, Provider::Kaspersky).await?;
//! ```

pub mod memory;
pub mod shared;

pub use memory::MemoryCache;
pub use shared::RedisCache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::Result;
use crate::models::{LookupOutcome, PhoneNumber, Provider};

/// Shared, read-mostly store of prior lookup outcomes
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Fresh outcome for the key, or `None` on miss or expiry
    async fn get(&self, number: &PhoneNumber, provider: Provider) -> Result<Option<LookupOutcome>>;

    /// Store an outcome, overwriting any existing entry
    async fn put(
        &self,
        number: &PhoneNumber,
        provider: Provider,
        outcome: &LookupOutcome,
        ttl: Duration,
    ) -> Result<()>;

    /// Drop every entry and reset the counters; returns removed entries
    async fn invalidate_all(&self) -> Result<u64>;

    /// Current counters
    fn stats(&self) -> CacheStats;
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Serialized cache value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedOutcome {
    pub outcome: LookupOutcome,
    /// Unix timestamp when cached
    pub cached_at: i64,
}

/// Hash a normalized number so shared-store keys do not expose it
pub fn hash_number(number: &PhoneNumber) -> String {
    let mut hasher = Sha256::new();
    hasher.update(number.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}
