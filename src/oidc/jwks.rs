//! JWKS (JSON Web Key Set) fetching and caching.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;
use x509_parser::prelude::*;

/// How long fetched keys are trusted before the set is fetched again.
pub const DEFAULT_JWKS_REFRESH_SECS: u64 = 600; // 10 minutes

const DEFAULT_KID: &str = "default";

/// JWKS cache, populated lazily on first use and refreshed on unknown `kid`.
pub struct JwksCache {
    /// Cached keys: kid -> DecodingKey
    keys: RwLock<HashMap<String, DecodingKey>>,
    /// Last refresh timestamp, `None` until the first fetch
    last_refresh: RwLock<Option<Instant>>,
    /// Refresh interval
    refresh_interval: Duration,
    /// JWKS endpoint URL
    jwks_url: Url,
    /// HTTP client
    http_client: reqwest::Client,
}

/// JWKS response from the endpoint.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type, only RSA is accepted
    pub kty: String,
    /// Key ID
    pub kid: Option<String>,
    /// Algorithm
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA parameters
    /// RSA modulus (base64url)
    pub n: Option<String>,
    /// RSA exponent (base64url)
    pub e: Option<String>,

    /// X.509 certificate chain (base64 DER), leaf first
    pub x5c: Option<Vec<String>>,
}

impl JwksCache {
    /// Create an empty cache bound to a JWKS endpoint. Nothing is fetched yet.
    pub fn new(jwks_url: Url, http_client: reqwest::Client, refresh_interval: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            refresh_interval,
            jwks_url,
            http_client,
        }
    }

    pub fn jwks_url(&self) -> &Url {
        &self.jwks_url
    }

    /// Get the decoding key for a token's `kid`, or any signing key without one.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        self.refresh_if_needed().await?;

        let Some(kid) = kid else {
            return self.first_key();
        };
        if let Some(key) = self.cached(kid)? {
            return Ok(key);
        }

        // Key not found, the provider may have rotated
        debug!(kid = %kid, "Key not found in cache, refreshing JWKS");
        self.refresh().await?;

        if let Some(key) = self.cached(kid)? {
            return Ok(key);
        }
        Err(anyhow!("Key with kid '{}' not found in JWKS", kid))
    }

    fn cached(&self, kid: &str) -> Result<Option<DecodingKey>> {
        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(keys.get(kid).cloned())
    }

    fn first_key(&self) -> Result<DecodingKey> {
        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        keys.values()
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("No keys available in JWKS"))
    }

    /// Refresh the cache if it was never filled or the refresh interval has elapsed.
    pub async fn refresh_if_needed(&self) -> Result<()> {
        let should_refresh = {
            let last = self.last_refresh.read().map_err(|_| anyhow!("Lock poisoned"))?;
            last.map_or(true, |at| at.elapsed() >= self.refresh_interval)
        };

        if should_refresh {
            self.refresh().await?;
        }

        Ok(())
    }

    /// Force refresh the JWKS cache.
    pub async fn refresh(&self) -> Result<()> {
        debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(self.jwks_url.clone())
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "JWKS endpoint returned status {}",
                response.status()
            ));
        }

        let jwks: Jwks = response.json().await.context("Failed to parse JWKS")?;

        let mut new_keys = HashMap::new();
        for jwk in jwks.keys {
            // Skip encryption keys
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match Self::jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| DEFAULT_KID.to_string());
                    debug!(kid = %kid, kty = %jwk.kty, alg = ?jwk.alg, "Loaded JWK");
                    new_keys.insert(kid, key);
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }

        if new_keys.is_empty() {
            return Err(anyhow!("No valid signing keys found in JWKS"));
        }

        let key_count = new_keys.len();
        {
            let mut keys = self.keys.write().map_err(|_| anyhow!("Lock poisoned"))?;
            *keys = new_keys;
        }
        {
            let mut last = self
                .last_refresh
                .write()
                .map_err(|_| anyhow!("Lock poisoned"))?;
            *last = Some(Instant::now());
        }

        info!(url = %self.jwks_url, key_count, "JWKS cache refreshed");

        Ok(())
    }

    /// Convert a JWK to a DecodingKey.
    ///
    /// For RSA keys the modulus/exponent pair wins over the certificate chain
    /// when both are published.
    fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
        match jwk.kty.as_str() {
            "RSA" => match (&jwk.n, &jwk.e, &jwk.x5c) {
                (Some(n), Some(e), _) => DecodingKey::from_rsa_components(n, e)
                    .context("Failed to create RSA DecodingKey"),
                (_, _, Some(chain)) if !chain.is_empty() => Self::rsa_key_from_certificate(&chain[0]),
                _ => Err(anyhow!("RSA key has neither 'n'/'e' nor 'x5c'")),
            },
            kty => Err(anyhow!("Unsupported key type: {}", kty)),
        }
    }

    /// RSA public key from the leaf certificate of an `x5c` chain.
    fn rsa_key_from_certificate(encoded: &str) -> Result<DecodingKey> {
        let der = BASE64
            .decode(encoded)
            .context("Failed to decode x5c certificate")?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

        // The SPKI bit string of an RSA key is the PKCS#1 RSAPublicKey
        Ok(DecodingKey::from_rsa_der(
            &cert.public_key().subject_public_key.data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, TEST_CERT_X5C, TEST_KID};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse(value: serde_json::Value) -> Jwk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rsa_components() {
        let jwk: Jwk = serde_json::from_value(test_support::test_jwk()).unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some(TEST_KID));
        assert!(JwksCache::jwk_to_decoding_key(&jwk).is_ok());
    }

    #[test]
    fn test_rsa_from_certificate() {
        let jwk = parse(json!({ "kty": "RSA", "kid": "cert", "x5c": [TEST_CERT_X5C] }));
        assert!(JwksCache::jwk_to_decoding_key(&jwk).is_ok());
    }

    #[test]
    fn test_components_preferred_over_certificate() {
        let mut value = test_support::test_jwk();
        value["x5c"] = json!(["bm90IGEgY2VydGlmaWNhdGU="]);
        // The broken certificate is never looked at
        assert!(JwksCache::jwk_to_decoding_key(&parse(value)).is_ok());
    }

    #[test]
    fn test_rsa_without_key_material() {
        let jwk = parse(json!({ "kty": "RSA", "kid": "empty" }));
        assert!(JwksCache::jwk_to_decoding_key(&jwk).is_err());

        let jwk = parse(json!({ "kty": "RSA", "kid": "empty", "x5c": [] }));
        assert!(JwksCache::jwk_to_decoding_key(&jwk).is_err());

        let jwk = parse(json!({ "kty": "oct", "k": "c2VjcmV0" }));
        assert!(JwksCache::jwk_to_decoding_key(&jwk).is_err());
    }

    #[tokio::test]
    async fn test_non_rsa_keys_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "EC",
                    "kid": "ec-key",
                    "crv": "P-256",
                    "x": "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
                    "y": "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"
                }]
            })))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let cache = JwksCache::new(url, reqwest::Client::new(), Duration::from_secs(600));
        let Err(err) = cache.get_key(Some("ec-key")).await else {
            panic!("EC key should not be usable");
        };
        assert!(err.to_string().contains("No valid signing keys"));
    }

    #[tokio::test]
    async fn test_lazy_fetch_and_unknown_kid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [
                    test_support::test_jwk(),
                    { "kty": "RSA", "kid": "enc-key", "use": "enc", "n": "AQAB", "e": "AQAB" }
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let cache = JwksCache::new(url, reqwest::Client::new(), Duration::from_secs(600));

        assert!(cache.get_key(Some(TEST_KID)).await.is_ok());
        assert!(cache.get_key(Some(TEST_KID)).await.is_ok());
        // Unknown kid forces one more fetch, then fails
        assert!(cache.get_key(Some("rotated-away")).await.is_err());
        // No kid falls back to the only signing key
        assert!(cache.get_key(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_endpoint_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap();
        let cache = JwksCache::new(url, reqwest::Client::new(), Duration::from_secs(600));
        let Err(err) = cache.get_key(Some(TEST_KID)).await else {
            panic!("JWKS fetch should fail");
        };
        assert!(err.to_string().contains("503"));
    }
}
