//! Key/value store backed by redb embedded database.
//!
//! Provides persistent single-node storage with:
//! - TTL-based expiry checked on every read
//! - Atomic set-if-absent and compare-and-delete for refresh locks
//! - Bulk eviction of expired entries

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::KeyValueStore;

/// redb table for entries (key: storage key, value: MessagePack bytes).
const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_entries");

/// A stored value with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn new(value: &str, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl).context("TTL out of range")?;
        Ok(Self {
            value: value.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Persistent [`KeyValueStore`] on redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
        }
        write_txn.commit()?;

        let store = Self { db };
        debug!(path = ?path, entries = store.entry_count()?, "Opened redb store");
        Ok(store)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn entry_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;

        match table.get(key)? {
            Some(value) => {
                let entry: StoredEntry = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize entry")?;
                Ok(Some(entry).filter(|e| !e.is_expired()))
            }
            None => Ok(None),
        }
    }

    fn write_entry(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let data = rmp_serde::to_vec(entry).context("Failed to serialize entry")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Run `decide` against the current live entry inside one write transaction.
    ///
    /// redb serializes write transactions, so the read-decide-write sequence is
    /// atomic with respect to other writers of this database.
    fn update<F, T>(&self, key: &str, decide: F) -> Result<T>
    where
        F: FnOnce(Option<StoredEntry>) -> Result<(Update, T)>,
    {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            let current = match table.get(key)? {
                Some(value) => rmp_serde::from_slice::<StoredEntry>(value.value())
                    .map_err(|e| {
                        warn!(key = %key, error = %e, "Failed to deserialize entry, treating as absent");
                        e
                    })
                    .ok()
                    .filter(|e| !e.is_expired()),
                None => None,
            };

            let (update, result) = decide(current)?;
            match update {
                Update::Keep => {}
                Update::Put(entry) => {
                    let data = rmp_serde::to_vec(&entry).context("Failed to serialize entry")?;
                    table.insert(key, data.as_slice())?;
                }
                Update::Remove => {
                    table.remove(key)?;
                }
            }
            result
        };
        write_txn.commit()?;
        Ok(result)
    }
}

enum Update {
    Keep,
    Put(StoredEntry),
    Remove,
}

#[async_trait]
impl KeyValueStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_entry(key)?.map(|e| e.value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write_entry(key, &StoredEntry::new(value, ttl)?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.update(key, |current| match current {
            Some(entry) => Ok((Update::Put(StoredEntry::new(&entry.value, ttl)?), true)),
            None => Ok((Update::Keep, false)),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.update(key, |current| Ok((Update::Remove, current.is_some())))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read_entry(key)?.is_some())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.update(key, |current| match current {
            Some(_) => Ok((Update::Keep, false)),
            None => Ok((Update::Put(StoredEntry::new(value, ttl)?), true)),
        })
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        self.update(key, |current| match current {
            Some(entry) if entry.value == expected => Ok((Update::Remove, true)),
            _ => Ok((Update::Keep, false)),
        })
    }

    async fn evict_expired(&self) -> Result<usize> {
        // Collect expired keys first, then delete in one transaction
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ENTRIES_TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<StoredEntry>(value.value()) {
                    Ok(stored) if stored.is_expired() => {
                        keys.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to deserialize entry, marking for deletion");
                        keys.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut evicted = 0;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            for key in &expired {
                if table.remove(key.as_str())?.is_some() {
                    evicted += 1;
                }
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.redb");
        let store = RedbStore::open(path).unwrap();
        (store, dir)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _dir) = test_store();

        store.set_ex("key", "value", HOUR).await.unwrap();
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("value"));
        assert!(store.exists("key").await.unwrap());
        assert!(store.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_invisible() {
        let (store, _dir) = test_store();

        // Write an entry that is already expired
        let entry = StoredEntry {
            value: "stale".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(10),
        };
        store.write_entry("key", &entry).unwrap();

        assert!(store.get("key").await.unwrap().is_none());
        assert!(!store.exists("key").await.unwrap());
        assert!(!store.expire("key", HOUR).await.unwrap());
        assert!(store.set_nx_ex("key", "fresh", HOUR).await.unwrap());
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = test_store();

        store.set_ex("key", "value", HOUR).await.unwrap();
        assert!(store.delete("key").await.unwrap());
        assert!(!store.delete("key").await.unwrap());
        assert!(store.get("key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let (store, _dir) = test_store();

        assert!(store.set_nx_ex("locks:a", "owner-1", HOUR).await.unwrap());
        assert!(!store.set_nx_ex("locks:a", "owner-2", HOUR).await.unwrap());

        assert!(!store.delete_if_eq("locks:a", "owner-2").await.unwrap());
        assert!(store.delete_if_eq("locks:a", "owner-1").await.unwrap());
        assert!(store.set_nx_ex("locks:a", "owner-2", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let (store, _dir) = test_store();

        store.set_ex("live", "value", HOUR).await.unwrap();
        let expired = StoredEntry {
            value: "stale".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(10),
        };
        store.write_entry("stale", &expired).unwrap();
        assert_eq!(store.entry_count().unwrap(), 2);

        assert_eq!(store.evict_expired().await.unwrap(), 1);
        assert_eq!(store.entry_count().unwrap(), 1);
        assert!(store.exists("live").await.unwrap());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.redb");

        {
            let store = RedbStore::open(path.clone()).unwrap();
            store.set_ex("key", "value", HOUR).await.unwrap();
        }

        let store = RedbStore::open(path).unwrap();
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("value"));
    }
}
