//! Background eviction of expired entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::KeyValueStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically evicts expired entries.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<dyn KeyValueStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.evict_expired().await {
                Ok(count) if count > 0 => {
                    info!(evicted = count, "Storage cleanup completed");
                }
                Ok(_) => {
                    debug!("Storage cleanup: no expired entries");
                }
                Err(e) => {
                    warn!(error = %e, "Storage cleanup failed");
                }
            }
        }
    })
}
