//! HTTP client for the identity provider.
//!
//! Every call goes through the rate limiter of its endpoint and is retried on
//! 429 up to the configured number of attempts.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::rate_limit::{RateLimiter, DELAY_STEP_MS};
use super::response::verify_response;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::oidc::VerifierCache;

/// Provider client shared by all requests of a process.
pub struct ProviderClient {
    pub(super) config: ProviderConfig,
    pub(super) http: reqwest::Client,
    pub(super) verifiers: Arc<VerifierCache>,
    pub(super) token_limiter: RateLimiter,
    pub(super) userinfo_limiter: RateLimiter,
}

impl ProviderClient {
    /// Client with its own verifier cache.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let verifiers = Arc::new(VerifierCache::new(http.clone()));
        Ok(Self::with_verifiers(config, http, verifiers))
    }

    /// Client sharing a verifier cache with other clients.
    pub fn with_verifiers(
        config: ProviderConfig,
        http: reqwest::Client,
        verifiers: Arc<VerifierCache>,
    ) -> Self {
        Self {
            config,
            http,
            verifiers,
            token_limiter: RateLimiter::new(),
            userinfo_limiter: RateLimiter::new(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn verifiers(&self) -> &Arc<VerifierCache> {
        &self.verifiers
    }

    /// Send a request, throttled by `limiter` under `id`, retrying on 429.
    pub(super) async fn send_throttled<F>(
        &self,
        limiter: &RateLimiter,
        id: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let max_attempts = self.config.max_retry_attempts.max(1);

        for attempt in 1..=max_attempts {
            limiter.wait(id).await;

            let response = build(&self.http).send().await?;
            limiter.update_from_headers(id, response.headers());

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            warn!(
                url = %response.url(),
                attempt,
                max_attempts,
                "Provider rate limit hit"
            );

            // Without usable headers the limiter has nothing to wait on
            if attempt < max_attempts && limiter.delay(id) == 0 {
                let backoff = DELAY_STEP_MS * u64::from(attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(Error::RateLimited {
            attempts: max_attempts,
        })
    }

    /// Read and classify a response from `endpoint`.
    pub(super) async fn read_body<T: DeserializeOwned>(
        endpoint: &Url,
        response: Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.bytes().await?;
        debug!(endpoint = %endpoint, status = status.as_u16(), "Provider responded");
        verify_response(endpoint, status, &body)
    }
}
