//! Keyed storage with per-entry TTL.
//!
//! Sessions and refresh locks are the only cluster-wide state; both live in a
//! [`KeyValueStore`]. Values are opaque strings and every write carries a TTL.

pub mod cleanup;
pub mod memory;
pub mod redb_store;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;

/// String key/value storage with expiring entries.
///
/// Expired entries must be invisible to every operation even before
/// [`evict_expired`](KeyValueStore::evict_expired) has removed them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any existing one, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the TTL of an existing entry. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remove an entry. Returns false if the key was absent.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check whether a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Write a value only if no live entry exists. Returns true if written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove an entry only if it currently holds `expected`. Returns true if removed.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Physically remove expired entries. Returns the number removed.
    async fn evict_expired(&self) -> Result<usize>;
}
