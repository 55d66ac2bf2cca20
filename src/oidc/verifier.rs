//! JWT verification against a provider's JWKS, with a bounded verifier cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jsonwebtoken::{decode, decode_header, Validation};
use moka::sync::Cache;
use tracing::debug;
use url::Url;

use super::claims::DecodedJwt;
use super::jwks::{JwksCache, DEFAULT_JWKS_REFRESH_SECS};
use crate::config::ProviderConfig;
use crate::error::{Error, Result, TokenKind};

/// Maximum number of authorization domains with a live verifier.
pub const VERIFIER_CACHE_CAPACITY: u64 = 10;

/// Maximum age of a cached verifier.
pub const VERIFIER_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60; // 7 days

/// Verifies tokens of one issuer with keys from one JWKS endpoint.
pub struct Verifier {
    jwks: JwksCache,
    issuer: String,
    leeway_secs: u64,
}

impl Verifier {
    pub fn new(jwks: JwksCache, issuer: impl Into<String>, leeway_secs: u64) -> Self {
        Self {
            jwks,
            issuer: issuer.into(),
            leeway_secs,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Check signature, issuer and expiry, and return the claims.
    pub async fn verify(&self, token: &str) -> anyhow::Result<DecodedJwt> {
        let header = decode_header(token).context("Failed to decode token header")?;
        debug!(kid = ?header.kid, alg = ?header.alg, "Verifying token");

        let decoding_key = self.jwks.get_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss"]);

        let token_data = decode::<DecodedJwt>(token, &decoding_key, &validation)
            .context("Token validation failed")?;
        Ok(token_data.claims)
    }
}

/// Verifiers keyed by authorization domain.
///
/// A miss only costs a reconstruction, so eviction never affects correctness.
pub struct VerifierCache {
    verifiers: Cache<String, Arc<Verifier>>,
    http_client: reqwest::Client,
    jwks_refresh: Duration,
}

impl VerifierCache {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            verifiers: Cache::builder()
                .max_capacity(VERIFIER_CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(VERIFIER_CACHE_TTL_SECS))
                .build(),
            http_client,
            jwks_refresh: Duration::from_secs(DEFAULT_JWKS_REFRESH_SECS),
        }
    }

    /// Verifier for `domain`, built on a miss.
    pub fn verifier(
        &self,
        domain: &str,
        jwks_url: &Url,
        issuer: &str,
        leeway_secs: u64,
    ) -> Arc<Verifier> {
        self.verifiers.get_with(domain.to_string(), || {
            debug!(domain = %domain, jwks = %jwks_url, "Creating token verifier");
            let jwks = JwksCache::new(jwks_url.clone(), self.http_client.clone(), self.jwks_refresh);
            Arc::new(Verifier::new(jwks, issuer, leeway_secs))
        })
    }

    /// Verify a provider-issued token and decode its claims.
    ///
    /// Failures are tagged with `kind` so id- and access-token problems stay
    /// distinguishable.
    pub async fn verify_and_decode(
        &self,
        token: &str,
        kind: TokenKind,
        config: &ProviderConfig,
    ) -> Result<DecodedJwt> {
        let verifier = self.verifier(
            &config.authorization_domain,
            &config.urls.jwks,
            &config.urls.issuer,
            config.clock_skew_secs,
        );
        verifier
            .verify(token)
            .await
            .map_err(|e| Error::verification(kind, e))
    }

    /// Drop the verifier of one domain.
    pub fn invalidate(&self, domain: &str) {
        self.verifiers.invalidate(domain);
    }
}
