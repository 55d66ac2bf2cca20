//! Deduplicated fetch-with-expiry cache.
//!
//! One slot of cached data guarded by an async mutex that is held across the
//! upstream fetch: callers arriving while a fetch is in flight queue on the
//! mutex and then find the fresh value instead of starting their own fetch.
//! A failed fetch leaves the slot empty, so the next queued caller fetches.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Boxed future returned by a fetch function.
pub type FetchFuture<D> = Pin<Box<dyn Future<Output = Result<D>> + Send + 'static>>;

type FetchFn<I, D> = Box<dyn Fn(I) -> FetchFuture<D> + Send + Sync>;
type MapFn<D, O> = Box<dyn Fn(&D) -> O + Send + Sync>;
type ExpiredFn<D> = Box<dyn Fn(&D) -> bool + Send + Sync>;

/// Single-flight cache parameterized by its fetch, projection and expiry.
pub struct SingleFlight<I, D, O> {
    fetch: FetchFn<I, D>,
    map_output: MapFn<D, O>,
    is_expired: ExpiredFn<D>,
    slot: Mutex<Option<D>>,
}

impl<I, D, O> SingleFlight<I, D, O>
where
    D: Send,
{
    pub fn new<F, M, E>(fetch: F, map_output: M, is_expired: E) -> Self
    where
        F: Fn(I) -> FetchFuture<D> + Send + Sync + 'static,
        M: Fn(&D) -> O + Send + Sync + 'static,
        E: Fn(&D) -> bool + Send + Sync + 'static,
    {
        Self {
            fetch: Box::new(fetch),
            map_output: Box::new(map_output),
            is_expired: Box::new(is_expired),
            slot: Mutex::new(None),
        }
    }

    /// Return the cached output, fetching first if nothing fresh is cached.
    pub async fn get(&self, input: I) -> Result<O> {
        let mut slot = self.slot.lock().await;

        if let Some(data) = slot.as_ref() {
            if !(self.is_expired)(data) {
                return Ok((self.map_output)(data));
            }
            debug!("Cached data expired, fetching again");
            *slot = None;
        }

        let data = (self.fetch)(input).await?;
        let output = (self.map_output)(&data);
        *slot = Some(data);
        Ok(output)
    }

    /// Drop the cached data.
    pub async fn clear(&self) {
        self.slot.lock().await.take();
    }
}
