//! Encrypted, TTL-bound session storage.
//!
//! Records are encrypted per session and written under a hashed address with
//! a sliding expiry: every successful read renews the TTL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use super::crypto;
use super::types::{SessionId, SessionRecord};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::storage::KeyValueStore;

/// Encrypted session store over a [`KeyValueStore`].
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    secret: String,
    salt: String,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store after validating the configuration.
    pub fn new(backend: Arc<dyn KeyValueStore>, config: &SessionConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        Ok(Self {
            backend,
            secret: config.secret.clone(),
            salt: config.salt.clone(),
            ttl: Duration::from_secs(config.ttl_secs),
        })
    }

    /// Fresh random session ID.
    pub fn generate_id(&self) -> SessionId {
        SessionId::generate()
    }

    /// Whether `candidate` can address a session at all.
    pub fn is_valid_id(&self, candidate: &str) -> bool {
        SessionId::is_valid(candidate)
    }

    /// Session TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Underlying storage, shared with the refresh lock.
    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }

    pub(crate) fn salt(&self) -> &str {
        &self.salt
    }

    /// Storage address of a session.
    pub fn storage_key(&self, id: &SessionId) -> String {
        crypto::storage_key(id.as_str(), &self.salt)
    }

    /// Encrypt and write a record, replacing any previous one.
    pub async fn set(&self, id: &SessionId, record: &SessionRecord) -> Result<()> {
        let key = self.storage_key(id);
        let blob = crypto::encrypt_data(id.as_str(), &self.salt, &self.secret, record)
            .context("Failed to seal session record")?;

        self.backend.set_ex(&key, &blob, self.ttl).await?;
        debug!(key = %key, "Session stored");
        Ok(())
    }

    /// Read and decrypt a record.
    ///
    /// Invalid ids, missing sessions and undecryptable payloads all yield an
    /// empty record. Storage failures propagate.
    pub async fn get(&self, candidate: &str) -> Result<SessionRecord> {
        self.read(candidate, true).await
    }

    /// Like [`get`](Self::get) but leaves the TTL alone.
    pub async fn peek(&self, candidate: &str) -> Result<SessionRecord> {
        self.read(candidate, false).await
    }

    async fn read(&self, candidate: &str, renew: bool) -> Result<SessionRecord> {
        let Some(id) = SessionId::parse(candidate) else {
            return Ok(SessionRecord::default());
        };
        let key = self.storage_key(&id);

        let Some(blob) = self.backend.get(&key).await? else {
            return Ok(SessionRecord::default());
        };

        match crypto::decrypt_data::<SessionRecord>(id.as_str(), &self.salt, &self.secret, &blob) {
            Some(record) => {
                if renew {
                    self.backend.expire(&key, self.ttl).await?;
                }
                Ok(record)
            }
            None => {
                warn!(key = %key, "Session payload could not be decrypted, treating as absent");
                Ok(SessionRecord::default())
            }
        }
    }

    /// Remove a session. Missing sessions and invalid ids are a no-op.
    pub async fn delete(&self, candidate: &str) -> Result<()> {
        if let Some(id) = SessionId::parse(candidate) {
            let key = self.storage_key(&id);
            let removed = self.backend.delete(&key).await?;
            debug!(key = %key, removed, "Session deleted");
        }
        Ok(())
    }

    /// Whether a session exists, without decrypting it.
    pub async fn has(&self, candidate: &str) -> Result<bool> {
        match SessionId::parse(candidate) {
            Some(id) => Ok(self.backend.exists(&self.storage_key(&id)).await?),
            None => Ok(false),
        }
    }
}
