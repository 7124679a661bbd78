//! In-process key-value store.
//!
//! Backs development setups and tests where a real key-value engine
//! is not running. Semantics match the redis implementation: TTLs,
//! tag sets, FIFO queues.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

use super::KvStore;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    tags: HashMap<String, HashSet<String>>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
}

/// In-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                // Expired; collect it lazily like the real store would.
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[&str]) -> Result<()> {
        let mut state = self.lock();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        for tag in tags {
            state
                .tags
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn del_tag(&self, tag: &str) -> Result<u64> {
        let mut state = self.lock();
        let members = state.tags.remove(tag).unwrap_or_default();
        let mut removed = 0;
        for key in members {
            if state.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_by_ttl() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", Duration::from_millis(20), &[])
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let kv = MemoryKv::new();
        kv.enqueue("jobs", b"first").await.unwrap();
        kv.enqueue("jobs", b"second").await.unwrap();

        assert_eq!(kv.dequeue("jobs").await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(kv.dequeue("jobs").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(kv.dequeue("jobs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_tag_counts_live_members() {
        let kv = MemoryKv::new();
        kv.set("a", b"1", Duration::from_secs(60), &["t"])
            .await
            .unwrap();
        kv.set("b", b"2", Duration::from_secs(60), &["t"])
            .await
            .unwrap();
        kv.del("b").await.unwrap();

        assert_eq!(kv.del_tag("t").await.unwrap(), 1);
        assert_eq!(kv.get("a").await.unwrap(), None);
    }
}
