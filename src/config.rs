//! Configuration for sessions, the identity provider and the coordinator.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Encrypted session storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Secret mixed into every record encryption key.
    pub secret: String,

    /// Salt mixed into both the storage address and the encryption key.
    pub salt: String,

    /// Session lifetime in seconds, renewed on every successful read.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

fn default_session_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

impl SessionConfig {
    /// Create a session config with the default TTL.
    pub fn new(secret: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            salt: salt.into(),
            ttl_secs: default_session_ttl(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.secret.is_empty() {
            return Err("session secret is required".to_string());
        }
        if self.salt.is_empty() {
            return Err("session salt is required".to_string());
        }
        if self.ttl_secs == 0 {
            return Err("session ttl_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Identity provider settings as they appear in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// OAuth client ID.
    pub client_id: String,

    /// OAuth client secret.
    pub client_secret: String,

    /// Provider domain; only its origin is used.
    /// Example: "https://tenant.auth.example.com"
    pub domain: String,

    /// Audience requested at login. Defaults to the userinfo endpoint, in which
    /// case the provider issues opaque (non-JWT) access tokens.
    #[serde(default)]
    pub audience: Option<String>,

    /// Audience requested for client-credentials tokens.
    /// Defaults to `<origin>/api/v2/`.
    #[serde(default)]
    pub service_audience: Option<String>,

    /// Clock skew tolerance in seconds for exp validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Maximum attempts per provider call while it answers 429.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// HTTP timeout for provider calls in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_clock_skew() -> u64 {
    30
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_http_timeout() -> u64 {
    10
}

impl ProviderSettings {
    /// Settings with defaults for everything but the credentials and domain.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            domain: domain.into(),
            audience: None,
            service_audience: None,
            clock_skew_secs: default_clock_skew(),
            max_retry_attempts: default_max_retry_attempts(),
            http_timeout_secs: default_http_timeout(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.is_empty() {
            return Err("provider client_id is required".to_string());
        }
        if self.domain.is_empty() {
            return Err("provider domain is required".to_string());
        }
        if !self.domain.starts_with("https://") && !self.domain.starts_with("http://") {
            return Err("provider domain must be a valid HTTP(S) URL".to_string());
        }
        if self.max_retry_attempts == 0 {
            return Err("provider max_retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Resolved provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUrls {
    pub authorization: Url,
    pub token: Url,
    pub jwks: Url,
    pub issuer: String,
    pub userinfo: Url,
    pub logout: Url,
}

/// Provider configuration with all endpoint URLs derived from the domain origin.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Origin of the configured domain; keys the verifier cache.
    pub authorization_domain: String,
    pub audience: String,
    pub service_audience: String,
    pub urls: ProviderUrls,
    pub clock_skew_secs: u64,
    pub max_retry_attempts: u32,
    pub http_timeout_secs: u64,
}

impl ProviderConfig {
    /// Resolve endpoint URLs from validated settings.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        settings.validate().map_err(Error::Config)?;

        let domain = Url::parse(&settings.domain)
            .map_err(|e| Error::Config(format!("provider domain: {e}")))?;
        let origin = domain.origin().ascii_serialization();
        let base = Url::parse(&origin)
            .map_err(|e| Error::Config(format!("provider domain origin: {e}")))?;

        let endpoint = |path: &str| -> Result<Url> {
            base.join(path)
                .map_err(|e| Error::Config(format!("provider endpoint {path}: {e}")))
        };

        let urls = ProviderUrls {
            authorization: endpoint("/authorize")?,
            token: endpoint("/oauth/token")?,
            jwks: endpoint("/.well-known/jwks.json")?,
            issuer: endpoint("/")?.to_string(),
            userinfo: endpoint("/userinfo")?,
            logout: endpoint("/v2/logout")?,
        };

        let audience = settings
            .audience
            .clone()
            .unwrap_or_else(|| urls.userinfo.to_string());
        let service_audience = match settings.service_audience {
            Some(ref aud) => aud.clone(),
            None => endpoint("/api/v2/")?.to_string(),
        };

        Ok(Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            authorization_domain: origin,
            audience,
            service_audience,
            urls,
            clock_skew_secs: settings.clock_skew_secs,
            max_retry_attempts: settings.max_retry_attempts,
            http_timeout_secs: settings.http_timeout_secs,
        })
    }

    /// Shorthand for [`ProviderSettings::new`] followed by [`Self::from_settings`].
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self> {
        Self::from_settings(&ProviderSettings::new(client_id, client_secret, domain))
    }

    /// Whether access tokens are opaque strings rather than JWTs.
    ///
    /// When the login audience is the userinfo endpoint the provider hands out
    /// an access token that can only be used against userinfo.
    pub fn access_token_is_opaque(&self) -> bool {
        self.audience == self.urls.userinfo.as_str()
    }
}

/// Token lifecycle coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Refresh this many milliseconds before the recorded expiry.
    #[serde(default = "default_expiration_margin")]
    pub expiration_margin_ms: i64,

    /// Lease of the per-session refresh lock in milliseconds.
    #[serde(default = "default_refresh_lock_lease")]
    pub refresh_lock_lease_ms: u64,

    /// Scopes always requested at login.
    #[serde(default = "default_scopes")]
    pub default_scopes: Vec<String>,
}

fn default_expiration_margin() -> i64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_refresh_lock_lease() -> u64 {
    5000
}

fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email", "offline_access"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            expiration_margin_ms: default_expiration_margin(),
            refresh_lock_lease_ms: default_refresh_lock_lease(),
            default_scopes: default_scopes(),
        }
    }
}
