//! Token endpoint grants: authorization code, refresh token and client credentials.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::client::ProviderClient;
use super::userinfo::UserInfo;
use crate::error::{Error, Result, TokenKind};
use crate::session::SessionRecord;

/// Rate-limit identity of code exchanges, which have no per-user budget.
const CODE_EXCHANGE_LIMIT_ID: &str = "authorization_code";

/// Rate-limit identity of client-credentials requests.
const SERVICE_TOKEN_LIMIT_ID: &str = "client_credentials";

/// Token endpoint body before validation.
#[derive(Debug, Default, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    id_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
}

impl RawTokenResponse {
    fn require_access_token(&mut self) -> Result<String> {
        self.access_token
            .take()
            .ok_or_else(|| Error::validation("expected access_token to exist"))
    }

    fn require_id_token(&mut self) -> Result<String> {
        self.id_token
            .take()
            .ok_or_else(|| Error::validation("expected id_token to exist"))
    }

    fn require_expires_in(&self) -> Result<i64> {
        self.expires_in
            .ok_or_else(|| Error::validation("expected expires_in to exist"))
    }

    fn require_bearer(&self) -> Result<()> {
        match self.token_type.as_deref() {
            Some("Bearer") => Ok(()),
            other => Err(Error::validation(format!(
                "expected token_type to be 'Bearer', but got '{}'",
                other.unwrap_or_default()
            ))),
        }
    }

    fn require_refresh_token(&mut self) -> Result<String> {
        self.refresh_token
            .take()
            .ok_or_else(|| Error::validation("expected refresh_token to exist"))
    }
}

/// Verified tokens from a code exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: String,
    /// Present after a code exchange; a refresh keeps the existing one.
    pub refresh_token: Option<String>,
    /// Earliest token expiry in Unix milliseconds.
    pub expires: i64,
}

impl TokenSet {
    /// Merge into a session record, keeping the refresh token if none was issued.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        record.access_token = Some(self.access_token.clone());
        record.id_token = Some(self.id_token.clone());
        record.expires = Some(self.expires);
        if let Some(ref refresh_token) = self.refresh_token {
            record.refresh_token = Some(refresh_token.clone());
        }
    }
}

/// Client-credentials token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceToken {
    pub access_token: String,
    /// Expiry in Unix milliseconds.
    pub expires: i64,
    pub scope: Vec<String>,
}

/// The provider operations the token coordinator depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange an authorization code for a token set.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet>;

    /// Exchange a refresh token for fresh access and id tokens.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;

    /// Fetch the profile behind an access token.
    async fn user_info(&self, access_token: &str) -> Result<UserInfo>;
}

impl ProviderClient {
    async fn post_token(&self, limit_id: &str, body: serde_json::Value) -> Result<RawTokenResponse> {
        let endpoint = &self.config.urls.token;
        let response = self
            .send_throttled(&self.token_limiter, limit_id, |http| {
                http.post(endpoint.clone()).json(&body)
            })
            .await?;
        Self::read_body(endpoint, response).await
    }

    /// Verify the id token and, unless it is opaque, the access token.
    /// Returns the earlier expiry in milliseconds.
    async fn verify_pair(&self, id_token: &str, access_token: &str) -> Result<i64> {
        let id_claims = self
            .verifiers
            .verify_and_decode(id_token, TokenKind::Id, &self.config)
            .await?;
        let mut exp = id_claims.exp;

        if !self.config.access_token_is_opaque() {
            let access_claims = self
                .verifiers
                .verify_and_decode(access_token, TokenKind::Access, &self.config)
                .await?;
            exp = exp.min(access_claims.exp);
        }

        Ok(exp.saturating_mul(1000))
    }

    /// Authorization-code grant.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet> {
        debug!(url = %self.config.urls.token, "Exchanging authorization code");

        let mut raw = self
            .post_token(
                CODE_EXCHANGE_LIMIT_ID,
                json!({
                    "grant_type": "authorization_code",
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                    "code": code,
                    "redirect_uri": redirect_uri,
                }),
            )
            .await?;

        let access_token = raw.require_access_token()?;
        let id_token = raw.require_id_token()?;
        raw.require_bearer()?;
        raw.require_expires_in()?;
        let refresh_token = raw.require_refresh_token()?;

        let expires = self.verify_pair(&id_token, &access_token).await?;
        info!("Authorization code exchanged");

        Ok(TokenSet {
            access_token,
            id_token,
            refresh_token: Some(refresh_token),
            expires,
        })
    }

    /// Refresh-token grant. The refresh token itself is kept by the caller.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        debug!(url = %self.config.urls.token, "Refreshing tokens");

        // Keyed by a digest so the token never sits in limiter state
        let limit_id = hex::encode(Sha256::digest(refresh_token.as_bytes()));
        let mut raw = self
            .post_token(
                &limit_id,
                json!({
                    "grant_type": "refresh_token",
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                    "refresh_token": refresh_token,
                }),
            )
            .await?;

        let access_token = raw.require_access_token()?;
        let id_token = raw.require_id_token()?;
        raw.require_expires_in()?;
        raw.require_bearer()?;

        let expires = self.verify_pair(&id_token, &access_token).await?;
        info!("Tokens refreshed");

        Ok(TokenSet {
            access_token,
            id_token,
            refresh_token: raw.refresh_token.take(),
            expires,
        })
    }

    /// Client-credentials grant for the service audience.
    pub async fn client_credentials(&self) -> Result<ServiceToken> {
        debug!(audience = %self.config.service_audience, "Requesting service token");

        let mut raw = self
            .post_token(
                SERVICE_TOKEN_LIMIT_ID,
                json!({
                    "grant_type": "client_credentials",
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                    "audience": self.config.service_audience,
                }),
            )
            .await?;

        let access_token = raw.require_access_token()?;
        raw.require_bearer()?;

        let claims = self
            .verifiers
            .verify_and_decode(&access_token, TokenKind::Access, &self.config)
            .await?;
        let scope = claims.scopes().into_iter().map(String::from).collect();

        Ok(ServiceToken {
            access_token,
            expires: claims.expires_at_ms(),
            scope,
        })
    }
}

#[async_trait]
impl IdentityProvider for ProviderClient {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet> {
        ProviderClient::exchange_code(self, code, redirect_uri).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        ProviderClient::refresh(self, refresh_token).await
    }

    async fn user_info(&self, access_token: &str) -> Result<UserInfo> {
        ProviderClient::user_info(self, access_token).await
    }
}
