//! SeenStore — bounded, insertion-ordered, per-channel set of seen keys.
//!
//! Keys are added only after the sink accepts the unit that completes an
//! item. On `persist` each touched channel is truncated to the most recent
//! `cap` keys (plain FIFO eviction) and written through the backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::traits::StateStore;
use crate::error::StoreError;
use crate::pipeline::types::SeenKey;

#[derive(Default)]
struct Bucket {
    order: VecDeque<SeenKey>,
    members: HashSet<SeenKey>,
    dirty: bool,
}

impl Bucket {
    fn truncate_to(&mut self, cap: usize) -> usize {
        let mut evicted = 0;
        while self.order.len() > cap {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Per-channel seen-key sets over an injected backend.
pub struct SeenStore {
    backend: Arc<dyn StateStore>,
    cap: usize,
    buckets: HashMap<String, Bucket>,
}

impl SeenStore {
    pub fn new(backend: Arc<dyn StateStore>, cap: usize) -> Self {
        Self {
            backend,
            cap: cap.max(1),
            buckets: HashMap::new(),
        }
    }

    /// Load a channel's bucket from the backend, once per process.
    pub async fn load(&mut self, channel_key: &str) -> Result<(), StoreError> {
        if self.buckets.contains_key(channel_key) {
            return Ok(());
        }
        let stored = self.backend.get(channel_key).await?;
        let mut bucket = Bucket::default();
        for raw in stored {
            let key = SeenKey::from_hex(raw);
            if bucket.members.insert(key.clone()) {
                bucket.order.push_back(key);
            }
        }
        debug!(channel = %channel_key, keys = bucket.order.len(), "Seen bucket loaded");
        self.buckets.insert(channel_key.to_string(), bucket);
        Ok(())
    }

    pub fn contains(&self, channel_key: &str, key: &SeenKey) -> bool {
        self.buckets
            .get(channel_key)
            .is_some_and(|b| b.members.contains(key))
    }

    /// Mark a key seen. Re-adding a known key keeps its original position.
    pub fn add(&mut self, channel_key: &str, key: SeenKey) {
        let bucket = self.buckets.entry(channel_key.to_string()).or_default();
        if bucket.members.insert(key.clone()) {
            bucket.order.push_back(key);
            bucket.dirty = true;
        }
    }

    /// Keys held for a channel, oldest first.
    pub fn keys(&self, channel_key: &str) -> Vec<SeenKey> {
        self.buckets
            .get(channel_key)
            .map(|b| b.order.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Truncate touched channels to `cap`, write them, and flush.
    pub async fn persist(&mut self) -> Result<(), StoreError> {
        let cap = self.cap;
        for (channel_key, bucket) in self.buckets.iter_mut().filter(|(_, b)| b.dirty) {
            let evicted = bucket.truncate_to(cap);
            if evicted > 0 {
                debug!(channel = %channel_key, evicted, "Oldest seen keys evicted");
            }
            let keys = bucket.order.iter().map(|k| k.as_str().to_string()).collect();
            self.backend.set(channel_key, keys).await?;
        }
        self.backend.flush().await?;
        for bucket in self.buckets.values_mut() {
            bucket.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn key(n: usize) -> SeenKey {
        SeenKey::from_hex(format!("k{n}"))
    }

    #[tokio::test]
    async fn add_then_contains() {
        let backend = Arc::new(MemoryStore::new());
        let mut store = SeenStore::new(backend, 10);
        store.load("alpha").await.unwrap();
        assert!(!store.contains("alpha", &key(1)));
        store.add("alpha", key(1));
        assert!(store.contains("alpha", &key(1)));
        assert!(!store.contains("beta", &key(1)));
    }

    #[tokio::test]
    async fn persist_bounds_to_most_recent_cap() {
        let backend = Arc::new(MemoryStore::new());
        let mut store = SeenStore::new(backend.clone(), 3);
        store.load("alpha").await.unwrap();
        for n in 0..5 {
            store.add("alpha", key(n));
        }
        store.persist().await.unwrap();

        assert_eq!(backend.durable("alpha").await, vec!["k2", "k3", "k4"]);
        assert!(!store.contains("alpha", &key(0)));
        assert!(store.contains("alpha", &key(4)));
    }

    #[tokio::test]
    async fn load_reads_backend_state() {
        let backend = Arc::new(MemoryStore::with_state(HashMap::from([(
            "alpha".to_string(),
            vec!["k1".to_string(), "k1".to_string(), "k2".to_string()],
        )])));
        let mut store = SeenStore::new(backend, 10);
        store.load("alpha").await.unwrap();
        assert!(store.contains("alpha", &key(1)));
        assert_eq!(store.keys("alpha"), vec![key(1), key(2)]);
    }

    #[tokio::test]
    async fn re_adding_keeps_position() {
        let backend = Arc::new(MemoryStore::new());
        let mut store = SeenStore::new(backend, 10);
        store.add("a", key(1));
        store.add("a", key(2));
        store.add("a", key(1));
        assert_eq!(store.keys("a"), vec![key(1), key(2)]);
    }

    #[tokio::test]
    async fn untouched_channels_are_not_rewritten() {
        let backend = Arc::new(MemoryStore::with_state(HashMap::from([(
            "beta".to_string(),
            vec!["b1".to_string()],
        )])));
        let mut store = SeenStore::new(backend.clone(), 10);
        store.load("beta").await.unwrap();
        store.add("alpha", key(1));
        store.persist().await.unwrap();

        assert_eq!(backend.durable("beta").await, vec!["b1"]);
        assert_eq!(backend.durable("alpha").await, vec!["k1"]);
    }
}
