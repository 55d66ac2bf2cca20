//! Cluster-wide refresh lock keyed by session.
//!
//! Best-effort mutual exclusion: a single attempt against one store with a
//! lease TTL. A holder that crashes loses the lock when the lease runs out.
//! Acquisition never retries; contention is an ordinary outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::crypto;
use super::types::SessionId;
use crate::storage::KeyValueStore;

const LOCK_PREFIX: &str = "locks:";

/// Result of one acquisition attempt.
pub enum LockHandle {
    /// The caller holds the lock until the guard is released or the lease ends.
    Acquired(LockGuard),
    /// Someone else holds the lock.
    Unavailable,
}

impl LockHandle {
    pub fn acquired(&self) -> bool {
        matches!(self, LockHandle::Acquired(_))
    }
}

/// Proof of lock ownership.
///
/// Release consumes the guard, so it runs at most once. A guard dropped
/// without release (panic, cancelled future) releases in a background task.
pub struct LockGuard {
    backend: Arc<dyn KeyValueStore>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Release the lock if this guard still owns it.
    pub async fn release(mut self) {
        self.released = true;
        release_owned(self.backend.as_ref(), &self.key, &self.owner).await;
    }

    /// Run `critical` while holding the lock, releasing afterwards on every path.
    pub async fn scope<F, T>(self, critical: F) -> T
    where
        F: Future<Output = T>,
    {
        let outcome = critical.await;
        self.release().await;
        outcome
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_owned(backend.as_ref(), &key, &owner).await;
                });
            }
            Err(_) => {
                warn!(key = %key, "Lock guard dropped outside a runtime, lease will expire");
            }
        }
    }
}

async fn release_owned(backend: &dyn KeyValueStore, key: &str, owner: &str) {
    match backend.delete_if_eq(key, owner).await {
        Ok(true) => debug!(key = %key, "Lock released"),
        Ok(false) => debug!(key = %key, "Lock lease already expired"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release lock, lease will expire"),
    }
}

/// Lock factory over the session storage.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn KeyValueStore>,
    salt: String,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn KeyValueStore>, salt: impl Into<String>) -> Self {
        Self {
            backend,
            salt: salt.into(),
        }
    }

    /// Storage key of the lock guarding `id`.
    pub fn lock_key(&self, id: &SessionId) -> String {
        format!("{LOCK_PREFIX}{}", crypto::storage_key(id.as_str(), &self.salt))
    }

    /// Try once to take the lock for `id` with the given lease.
    ///
    /// Storage failures are reported as [`LockHandle::Unavailable`]: the caller
    /// then proceeds as if another holder were active.
    pub async fn lock(&self, id: &SessionId, lease: Duration) -> LockHandle {
        let key = self.lock_key(id);
        let owner = Uuid::new_v4().to_string();

        match self.backend.set_nx_ex(&key, &owner, lease).await {
            Ok(true) => {
                debug!(key = %key, lease_ms = lease.as_millis() as u64, "Lock acquired");
                LockHandle::Acquired(LockGuard {
                    backend: Arc::clone(&self.backend),
                    key,
                    owner,
                    released: false,
                })
            }
            Ok(false) => {
                debug!(key = %key, "Lock held elsewhere");
                LockHandle::Unavailable
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock acquisition failed");
                LockHandle::Unavailable
            }
        }
    }
}
