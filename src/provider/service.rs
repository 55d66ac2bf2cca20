//! Cached client-credentials token for calls made on the service's own behalf.

use std::sync::Arc;

use super::client::ProviderClient;
use super::token::ServiceToken;
use crate::error::Result;
use crate::now_millis;
use crate::single_flight::{FetchFuture, SingleFlight};

/// Tokens are replaced this long before they actually expire.
pub const SERVICE_TOKEN_EARLY_EXPIRY_MS: i64 = 60_000;

/// Single-flight cache of the service token.
pub struct ServiceTokenCache {
    inner: SingleFlight<(), ServiceToken, String>,
}

impl ServiceTokenCache {
    pub fn new(client: Arc<ProviderClient>) -> Self {
        let inner = SingleFlight::new(
            move |_: ()| -> FetchFuture<ServiceToken> {
                let client = Arc::clone(&client);
                Box::pin(async move { client.client_credentials().await })
            },
            |token: &ServiceToken| token.access_token.clone(),
            |token: &ServiceToken| token.expires <= now_millis() + SERVICE_TOKEN_EARLY_EXPIRY_MS,
        );
        Self { inner }
    }

    /// A valid service access token, fetched at most once at a time.
    pub async fn token(&self) -> Result<String> {
        self.inner.get(()).await
    }

    /// Forget the cached token, e.g. after the provider rejected it.
    pub async fn clear(&self) {
        self.inner.clear().await;
    }
}
