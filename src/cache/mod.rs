//! Key-value cache with cache-aside semantics and tag invalidation.
//!
//! The coordinator sits between the repositories and the relational
//! store: reads check the key-value store first and fall through to a
//! loader on miss, writes run first and then invalidate the affected
//! keys before the caller sees success. A key-value outage never
//! fails a read; it falls back to the loader and is counted so the
//! extra backend load is visible.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub use memory::MemoryKv;
pub use redis::RedisKv;

use crate::error::Result;
use crate::metrics::CacheMetrics;

/// The narrow contract the core needs from the key-value store:
/// get/set/del with TTLs, tag-scan invalidation, and queue
/// primitives. Everything else the engine offers is out of scope.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value with a TTL, registering it under each tag so a
    /// later [`KvStore::del_tag`] can find it without enumerating keys.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[&str]) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Delete every key registered under a tag; returns how many went.
    async fn del_tag(&self, tag: &str) -> Result<u64>;

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()>;

    async fn dequeue(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    async fn ping(&self) -> Result<()>;
}

/// Cache-aside coordinator between the key-value store and the
/// relational loaders.
pub struct CacheAside {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    metrics: Arc<CacheMetrics>,
}

impl CacheAside {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, metrics: Arc<CacheMetrics>) -> Self {
        Self { kv, ttl, metrics }
    }

    /// Read through the cache: a hit answers without touching the
    /// backing store, a miss runs the loader and fills the cache.
    ///
    /// Concurrent misses on the same key may each run the loader;
    /// stampede coalescing is deliberately not provided here.
    pub async fn read_through<T, F, Fut>(&self, key: &str, tags: &[&str], loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        self.read_through_with_tags(key, loader, move |_| tags).await
    }

    /// Like [`CacheAside::read_through`], but derives the tags from
    /// the loaded value. Used where the tag depends on a field the
    /// caller does not have yet, like the owning user of a session.
    pub async fn read_through_with_tags<T, F, Fut, G>(
        &self,
        key: &str,
        loader: F,
        tags_of: G,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce(&T) -> Vec<String>,
    {
        match self.kv.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.metrics.hit();
                    return Ok(value);
                }
                Err(e) => {
                    // Entry written by an older record shape; drop it
                    // and reload.
                    warn!(key, error = %e, "dropping undecodable cache entry");
                    let _ = self.kv.del(key).await;
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "key-value store unavailable, serving from loader");
                self.metrics.fallback();
                return loader().await;
            }
        }

        self.metrics.miss();
        let value = loader().await?;
        let tags = tags_of(&value);
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = self.kv.set(key, &bytes, self.ttl, &tag_refs).await {
                    warn!(key, error = %e, "cache fill failed");
                    self.metrics.fallback();
                }
            }
            Err(e) => warn!(key, error = %e, "value not cacheable"),
        }
        Ok(value)
    }

    /// Run a write against the backing store, then synchronously
    /// invalidate the affected keys and tags before returning success.
    /// The order matters: invalidating first would let a concurrent
    /// reader re-fill the cache with the pre-write value.
    pub async fn write_and_invalidate<T, F, Fut>(
        &self,
        keys: &[&str],
        tags: &[&str],
        writer: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = writer().await?;
        self.invalidate(keys, tags).await;
        Ok(value)
    }

    /// Delete keys and tag sets, best effort. A failure here is
    /// logged and counted rather than failing the already-committed
    /// write; the entry then ages out by TTL.
    pub async fn invalidate(&self, keys: &[&str], tags: &[&str]) {
        for key in keys {
            match self.kv.del(key).await {
                Ok(()) => self.metrics.invalidation(),
                Err(e) => {
                    warn!(key, error = %e, "cache invalidation failed");
                    self.metrics.fallback();
                }
            }
        }
        for tag in tags {
            self.invalidate_by_tag(tag).await;
        }
    }

    /// Invalidate every key sharing a tag in one logical operation.
    pub async fn invalidate_by_tag(&self, tag: &str) {
        match self.kv.del_tag(tag).await {
            Ok(count) => {
                debug!(tag, count, "tag invalidated");
                self.metrics.invalidation();
            }
            Err(e) => {
                warn!(tag, error = %e, "tag invalidation failed");
                self.metrics.fallback();
            }
        }
    }

    /// Direct access to the underlying store, for queue consumers.
    pub fn store(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::error::DataError;

    /// A key-value store that is always down.
    struct DownKv;

    #[async_trait]
    impl KvStore for DownKv {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Duration, _: &[&str]) -> Result<()> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn del_tag(&self, _tag: &str) -> Result<u64> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn enqueue(&self, _: &str, _: &[u8]) -> Result<()> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn dequeue(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Err(DataError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> Result<()> {
            Err(DataError::Backend("connection refused".into()))
        }
    }

    fn coordinator() -> (CacheAside, Arc<CacheMetrics>) {
        let metrics = Arc::new(CacheMetrics::default());
        let cache = CacheAside::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            metrics.clone(),
        );
        (cache, metrics)
    }

    #[tokio::test]
    async fn miss_loads_once_then_hits() {
        let (cache, metrics) = coordinator();
        let loads = AtomicU64::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("value".to_string())
        };

        let first: String = cache.read_through("user:42", &[], load).await.unwrap();
        assert_eq!(first, "value");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Within the TTL the loader must not run again.
        let second: String = cache
            .read_through("user:42", &[], || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("value".to_string())
            })
            .await
            .unwrap();
        assert_eq!(second, "value");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 1);
    }

    #[tokio::test]
    async fn reader_never_sees_the_pre_write_value() {
        let (cache, _) = coordinator();
        let database = Mutex::new("before".to_string());

        let cached: String = cache
            .read_through("setting:mode", &[], || async {
                Ok(database.lock().unwrap().clone())
            })
            .await
            .unwrap();
        assert_eq!(cached, "before");

        cache
            .write_and_invalidate(&["setting:mode"], &[], || async {
                *database.lock().unwrap() = "after".to_string();
                Ok(())
            })
            .await
            .unwrap();

        let reread: String = cache
            .read_through("setting:mode", &[], || async {
                Ok(database.lock().unwrap().clone())
            })
            .await
            .unwrap();
        assert_eq!(reread, "after");
    }

    #[tokio::test]
    async fn tag_invalidation_clears_every_member() {
        let (cache, _) = coordinator();
        let loads = AtomicU64::new(0);

        for key in ["session:a", "session:b"] {
            let _: String = cache
                .read_through(key, &["user-sessions:42"], || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key.to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        cache.invalidate_by_tag("user-sessions:42").await;

        for key in ["session:a", "session:b"] {
            let _: String = cache
                .read_through(key, &["user-sessions:42"], || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key.to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn kv_outage_falls_back_to_the_loader() {
        let metrics = Arc::new(CacheMetrics::default());
        let cache = CacheAside::new(Arc::new(DownKv), Duration::from_secs(60), metrics.clone());

        for _ in 0..3 {
            let value: String = cache
                .read_through("user:42", &[], || async { Ok("fresh".to_string()) })
                .await
                .unwrap();
            assert_eq!(value, "fresh");
        }
        assert_eq!(metrics.snapshot().fallbacks, 3);
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped_and_reloaded() {
        let kv = Arc::new(MemoryKv::new());
        let cache = CacheAside::new(
            kv.clone(),
            Duration::from_secs(60),
            Arc::new(CacheMetrics::default()),
        );

        kv.set("user:42", b"not json", Duration::from_secs(60), &[])
            .await
            .unwrap();

        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Rec {
            id: u32,
        }

        let value: Rec = cache
            .read_through("user:42", &[], || async { Ok(Rec { id: 7 }) })
            .await
            .unwrap();
        assert_eq!(value, Rec { id: 7 });
    }
}
