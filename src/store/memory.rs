//! In-memory state store for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::StateStore;
use crate::error::StoreError;

/// Volatile store. `durable` only changes on `flush`, so tests can observe
/// exactly what a crash right after a cycle would have left behind.
#[derive(Default)]
pub struct MemoryStore {
    pending: Mutex<HashMap<String, Vec<String>>>,
    durable: Mutex<HashMap<String, Vec<String>>>,
    flushes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously persisted state.
    pub fn with_state(state: HashMap<String, Vec<String>>) -> Self {
        Self {
            pending: Mutex::new(state.clone()),
            durable: Mutex::new(state),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Durable keys for a channel.
    pub async fn durable(&self, channel_key: &str) -> Vec<String> {
        self.durable
            .lock()
            .await
            .get(channel_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Full durable state, for reseeding a fresh store after a "restart".
    pub async fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.durable.lock().await.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, channel_key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .pending
            .lock()
            .await
            .get(channel_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn set(&self, channel_key: &str, keys: Vec<String>) -> Result<(), StoreError> {
        self.pending
            .lock()
            .await
            .insert(channel_key.to_string(), keys);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let pending = self.pending.lock().await.clone();
        *self.durable.lock().await = pending;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_is_not_durable_until_flush() {
        let store = MemoryStore::new();
        store.set("a", vec!["k".into()]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), vec!["k"]);
        assert!(store.durable("a").await.is_empty());

        store.flush().await.unwrap();
        assert_eq!(store.durable("a").await, vec!["k"]);
        assert_eq!(store.flush_count(), 1);
    }
}
