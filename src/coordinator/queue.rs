//! Work queue shared through Redis
//!
//! Ready items sit in a list and are taken with `LPOP`, so each item goes to
//! exactly one instance. Delayed items wait in a sorted set scored by their
//! ready time in epoch milliseconds and are moved to the list by whichever
//! instance polls first.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::WorkItem;
use crate::scheduler::WorkQueue;

/// Moves due members of the delayed set onto the ready list atomically
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('RPUSH', KEYS[2], member)
end
return #due
"#;

const PROMOTE_BATCH: usize = 64;

/// Redis-backed [`WorkQueue`]
pub struct RedisWorkQueue {
    pool: Pool,
    ready_key: String,
    delayed_key: String,
    poll_interval: Duration,
    promote_script: Script,
}

impl RedisWorkQueue {
    pub fn new(pool: Pool, namespace: &str, poll_interval: Duration) -> Self {
        Self {
            pool,
            ready_key: format!("{namespace}:queue"),
            delayed_key: format!("{namespace}:delayed"),
            poll_interval,
            promote_script: Script::new(PROMOTE_SCRIPT),
        }
    }

    async fn promote_due(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let moved: usize = self
            .promote_script
            .key(&self.delayed_key)
            .key(&self.ready_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut *conn)
            .await?;
        if moved > 0 {
            debug!(moved, "Promoted delayed work items");
        }
        Ok(moved)
    }

    async fn pop_ready(&self) -> Result<Option<WorkItem>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.lpop(&self.ready_key, None).await?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(item) => Ok(Some(item)),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable work item");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn push(&self, item: WorkItem) -> Result<()> {
        let payload = serde_json::to_string(&item)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.rpush(&self.ready_key, payload).await?;
        Ok(())
    }

    async fn push_delayed(&self, item: WorkItem, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(&item)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.pool.get().await?;
        let _: () = conn.zadd(&self.delayed_key, payload, ready_at).await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<WorkItem>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.promote_due().await?;
            if let Some(item) = self.pop_ready().await? {
                return Ok(Some(item));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let ready: usize = conn.llen(&self.ready_key).await?;
        let delayed: usize = conn.zcard(&self.delayed_key).await?;
        Ok(ready + delayed)
    }
}
