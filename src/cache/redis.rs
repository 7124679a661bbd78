//! Redis-backed key-value store.
//!
//! Connections come from the pool manager and every command runs
//! through the key-value circuit breaker, so a down store trips fast
//! instead of stacking timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, pipe};

use crate::breaker::CircuitBreaker;
use crate::error::{DataError, Result};
use crate::pool::PoolManager;

use super::KvStore;

const TAG_PREFIX: &str = "tag:";

fn tag_key(tag: &str) -> String {
    format!("{TAG_PREFIX}{tag}")
}

/// [`KvStore`] over redis.
pub struct RedisKv {
    pools: Arc<PoolManager>,
    breaker: Arc<CircuitBreaker>,
}

impl RedisKv {
    pub fn new(pools: Arc<PoolManager>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { pools, breaker }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                let value: Option<Vec<u8>> = cmd("GET")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(DataError::from)?;
                Ok(value)
            })
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[&str]) -> Result<()> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                let mut batch = pipe();
                batch.cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_ms).ignore();
                for tag in tags {
                    let tag_key = tag_key(tag);
                    // Tag sets outlive their members so a late
                    // invalidation still finds every key.
                    batch.cmd("SADD").arg(&tag_key).arg(key).ignore();
                    batch
                        .cmd("PEXPIRE")
                        .arg(&tag_key)
                        .arg(ttl_ms.saturating_mul(4))
                        .ignore();
                }
                batch
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(DataError::from)
            })
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                cmd("DEL")
                    .arg(key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(DataError::from)
            })
            .await
    }

    async fn del_tag(&self, tag: &str) -> Result<u64> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                let tag_key = tag_key(tag);
                let members: Vec<String> = cmd("SMEMBERS")
                    .arg(&tag_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(DataError::from)?;

                let removed = if members.is_empty() {
                    0
                } else {
                    cmd("DEL")
                        .arg(&members)
                        .query_async::<u64>(&mut conn)
                        .await
                        .map_err(DataError::from)?
                };
                cmd("DEL")
                    .arg(&tag_key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(DataError::from)?;
                Ok(removed)
            })
            .await
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                cmd("LPUSH")
                    .arg(queue)
                    .arg(payload)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(DataError::from)
            })
            .await
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                let payload: Option<Vec<u8>> = cmd("RPOP")
                    .arg(queue)
                    .query_async(&mut conn)
                    .await
                    .map_err(DataError::from)?;
                Ok(payload)
            })
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.breaker
            .execute(|| async {
                let mut conn = self.pools.kv().await?;
                cmd("PING")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(DataError::from)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_keys_are_namespaced() {
        assert_eq!(tag_key("user-sessions:42"), "tag:user-sessions:42");
    }
}
