//! Cross-instance lease claims

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::pool::LeaseStore;

/// Deletes the key only while it still holds the caller's token
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lease table kept in Redis.
///
/// `try_claim` is `SET key token NX PX ttl`: exactly one instance wins a
/// given endpoint until the holder releases or the key expires.
pub struct RedisLeaseStore {
    pool: Pool,
    namespace: String,
    release_script: Script,
}

impl RedisLeaseStore {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn key(&self, endpoint_id: &str) -> String {
        format!("{}:lease:{}", self.namespace, endpoint_id)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_claim(&self, endpoint_id: &str, token: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(endpoint_id);
        let mut conn = self.pool.get().await?;

        // PX rejects zero
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;

        let claimed = reply.is_some();
        debug!(key = %key, claimed, "Lease claim attempt");
        Ok(claimed)
    }

    async fn release(&self, endpoint_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = self
            .release_script
            .key(self.key(endpoint_id))
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }

    fn is_shared(&self) -> bool {
        true
    }
}
