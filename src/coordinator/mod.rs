//! Distributed coordination over Redis
//!
//! When several scheduler instances share the same endpoints, lease claims
//! and the work queue move into Redis so every instance sees them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ instance A │   │ instance B │   │ instance C │
//! └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!       │ SET NX PX      │ LPOP           │ ZADD (delayed)
//!       └────────────────┼────────────────┘
//!                  ┌─────▼─────┐
//!                  │   Redis   │
//!                  │ {ns}:lease:{endpoint}
//!                  │ {ns}:queue
//!                  │ {ns}:delayed
//!                  └───────────┘
//! ```
//!
//! A lease is a key set only if absent, expiring with the lease TTL, so a
//! crashed holder's claim disappears on its own. Health state stays local to
//! each instance.
//!
//! # Usage
//!
//! ```ignore
//! use phonecheck::coordinator::{connect, RedisLeaseStore, RedisWorkQueue};
//!
//! let redis = connect("redis://localhost:6379", 16).await?;
//! let store = RedisLeaseStore::new(redis.clone(), "phonecheck");
//! let queue = RedisWorkQueue::new(redis, "phonecheck", Duration::from_millis(250));
//! ```

pub mod lease;
pub mod queue;

pub use lease::RedisLeaseStore;
pub use queue::RedisWorkQueue;

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use tracing::info;

use crate::error::{Error, Result};
use crate::utils::retry::{with_retry, BackoffPolicy};

/// Build a Redis connection pool and check that the server answers
pub async fn connect(url: &str, pool_size: usize) -> Result<Pool> {
    let pool = PoolConfig::from_url(url)
        .builder()
        .map_err(|e| Error::config(format!("invalid Redis URL '{url}': {e}")))?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::config(format!("failed to create Redis pool: {e}")))?;

    with_retry(&BackoffPolicy::new(3, 200, 2_000), || async {
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok::<_, Error>(())
    })
    .await?;

    info!(url = %url, pool_size, "Connected to Redis");
    Ok(pool)
}
