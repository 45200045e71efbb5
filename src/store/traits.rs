//! `StateStore` trait — the single async interface for relay persistence.
//!
//! The relay only needs a key-value view: one ordered list of seen keys per
//! channel bucket. Production backs it with one atomically replaced JSON
//! document; tests substitute the in-memory store.

use async_trait::async_trait;

use crate::error::StoreError;

/// Backend-agnostic key-value store of per-channel seen-key lists.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Keys stored for a channel, oldest first. Unknown channels are empty.
    async fn get(&self, channel_key: &str) -> Result<Vec<String>, StoreError>;

    /// Replace a channel's key list. Not durable until `flush`.
    async fn set(&self, channel_key: &str, keys: Vec<String>) -> Result<(), StoreError>;

    /// Make all prior `set` calls durable.
    async fn flush(&self) -> Result<(), StoreError>;
}
