//! Token lifecycle coordination.
//!
//! Resolves the authenticated caller behind a session id, refreshing tokens
//! shortly before they expire. A refresh runs under the per-session lock so
//! that at most one refresh-token exchange per session is in flight across
//! the cluster: providers rotate refresh tokens on use, and a second
//! concurrent refresher would be left holding a dead one. Callers that lose
//! the lock race carry on with the record they already have.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{CoordinatorConfig, ProviderConfig};
use crate::csrf;
use crate::error::{Error, Result};
use crate::now_millis;
use crate::oidc::{decode_unverified, DecodedJwt};
use crate::provider::{authorize_url, logout_url, IdentityProvider, TokenSet, UserInfo};
use crate::session::{DistributedLock, LockHandle, SessionId, SessionRecord, SessionStore};

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    /// Claims of the access token, `None` when it is opaque.
    pub access_token_data: Option<DecodedJwt>,
    pub id_token_data: Option<DecodedJwt>,
    pub access_token: String,
    pub id_token: Option<String>,
    /// Milliseconds until the recorded expiry; negative once past it.
    pub expires_in: i64,
}

impl CurrentUser {
    fn from_record(access_token: String, record: &SessionRecord, now: i64) -> Self {
        let access_token_data = decode_unverified(&access_token).ok();
        let id_token_data = record
            .id_token
            .as_deref()
            .and_then(|token| decode_unverified(token).ok());

        Self {
            access_token_data,
            id_token_data,
            access_token,
            id_token: record.id_token.clone(),
            expires_in: record.expires.map_or(0, |expires| expires - now),
        }
    }

    /// Subject of the id token, if it could be decoded.
    pub fn subject(&self) -> Option<&str> {
        self.id_token_data.as_ref().and_then(|claims| claims.sub.as_deref())
    }
}

/// A login redirect together with the session that must be set as cookie.
#[derive(Debug, Clone)]
pub struct LoginStart {
    pub session_id: SessionId,
    pub redirect: Url,
}

/// Session, lock and provider composed into the login and token lifecycle.
pub struct TokenCoordinator {
    sessions: SessionStore,
    lock: DistributedLock,
    provider: Arc<dyn IdentityProvider>,
    provider_config: ProviderConfig,
    config: CoordinatorConfig,
}

impl TokenCoordinator {
    pub fn new(
        sessions: SessionStore,
        provider: Arc<dyn IdentityProvider>,
        provider_config: ProviderConfig,
        config: CoordinatorConfig,
    ) -> Self {
        let lock = DistributedLock::new(Arc::clone(sessions.backend()), sessions.salt());
        Self {
            sessions,
            lock,
            provider,
            provider_config,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Whether a token expiring at `expires` is due for refresh at `now`.
    ///
    /// A record without an expiry is always due.
    pub fn is_expired(&self, expires: Option<i64>, now: i64) -> bool {
        match expires {
            Some(expires) => now >= expires - self.config.expiration_margin_ms,
            None => true,
        }
    }

    /// Resolve the caller behind a session cookie, refreshing tokens if due.
    ///
    /// Returns `None` for missing or invalid ids, absent sessions, sessions
    /// without an access token, and sessions whose access token has expired
    /// with no refresh token to renew it. A failed refresh propagates and
    /// leaves the stored record untouched.
    pub async fn current_user(&self, candidate: Option<&str>) -> Result<Option<CurrentUser>> {
        let Some(id) = candidate.and_then(SessionId::parse) else {
            return Ok(None);
        };

        let mut record = self.sessions.get(id.as_str()).await?;
        if record.access_token.is_none() {
            return Ok(None);
        }

        if self.is_expired(record.expires, now_millis()) {
            match self.refresh_record(&id, record).await? {
                Some(refreshed) => record = refreshed,
                None => return Ok(None),
            }
        }

        let Some(access_token) = record.access_token.clone() else {
            return Ok(None);
        };
        Ok(Some(CurrentUser::from_record(access_token, &record, now_millis())))
    }

    /// Refresh a due record. `None` means the tokens are past their hard
    /// expiry and cannot be renewed.
    async fn refresh_record(
        &self,
        id: &SessionId,
        record: SessionRecord,
    ) -> Result<Option<SessionRecord>> {
        let Some(refresh_token) = record.refresh_token.clone() else {
            // Inside the margin the access token is still usable
            let usable = record.expires.is_some_and(|expires| now_millis() < expires);
            debug!(usable, "Session is due for refresh but holds no refresh token");
            return Ok(usable.then_some(record));
        };

        let lease = Duration::from_millis(self.config.refresh_lock_lease_ms);
        match self.lock.lock(id, lease).await {
            LockHandle::Unavailable => {
                debug!("Refresh already in progress elsewhere, using current tokens");
                Ok(Some(record))
            }
            LockHandle::Acquired(guard) => {
                guard
                    .scope(async move {
                        let tokens = self.provider.refresh(&refresh_token).await?;
                        self.warn_if_within_margin(&tokens);

                        let mut merged = record;
                        tokens.apply_to(&mut merged);
                        self.sessions.set(id, &merged).await?;

                        info!(expires = tokens.expires, "Session tokens refreshed");
                        Ok::<_, Error>(merged)
                    })
                    .await
                    .map(Some)
            }
        }
    }

    fn warn_if_within_margin(&self, tokens: &TokenSet) {
        let now = now_millis();
        for (kind, token) in [("id", &tokens.id_token), ("access", &tokens.access_token)] {
            if let Ok(claims) = decode_unverified(token) {
                if self.is_expired(Some(claims.expires_at_ms()), now) {
                    warn!(
                        token = kind,
                        margin_ms = self.config.expiration_margin_ms,
                        "Refreshed token expires inside the expiration margin, every request will refresh"
                    );
                }
            }
        }
    }

    /// Read a session record. Invalid or missing sessions read as empty.
    pub async fn session(&self, candidate: Option<&str>) -> Result<SessionRecord> {
        match candidate {
            Some(candidate) => self.sessions.get(candidate).await,
            None => Ok(SessionRecord::default()),
        }
    }

    /// Write a session record, allocating a session id if the candidate is unusable.
    pub async fn save_session(
        &self,
        candidate: Option<&str>,
        record: &SessionRecord,
    ) -> Result<SessionId> {
        let id = candidate
            .and_then(SessionId::parse)
            .unwrap_or_else(|| self.sessions.generate_id());
        self.sessions.set(&id, record).await?;
        Ok(id)
    }

    /// Delete a session. Unknown sessions are a no-op.
    pub async fn clear_session(&self, candidate: Option<&str>) -> Result<()> {
        match candidate {
            Some(candidate) => self.sessions.delete(candidate).await,
            None => Ok(()),
        }
    }

    /// Start a login: remember a fresh CSRF secret in the session and build
    /// the provider redirect carrying the matching token.
    pub async fn begin_login<S: AsRef<str>>(
        &self,
        candidate: Option<&str>,
        redirect_uri: &str,
        scopes: &[S],
    ) -> Result<LoginStart> {
        let redirect = authorize_url(
            &self.provider_config,
            scopes,
            &self.config.default_scopes,
            redirect_uri,
        );

        let session_id = self
            .save_session(candidate, &SessionRecord::pending_login(redirect.csrf.secret))
            .await?;
        debug!("Login started");

        Ok(LoginStart {
            session_id,
            redirect: redirect.url,
        })
    }

    /// Finish a login from the provider callback.
    ///
    /// The `state` is checked against the session's CSRF secret before the
    /// code is exchanged; a failed check deletes the session. On success the
    /// session holds only the new token set.
    pub async fn complete_login(
        &self,
        candidate: &str,
        state: Option<&str>,
        code: Option<&str>,
        redirect_uri: &str,
    ) -> Result<SessionId> {
        let record = self.sessions.get(candidate).await?;

        if let Err(e) = csrf::verify(record.csrf_secret.as_deref(), state) {
            warn!(reason = %e, "Login callback failed CSRF verification");
            self.sessions.delete(candidate).await?;
            return Err(Error::Csrf(e));
        }

        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::validation("expected callback to carry a code"))?;

        // A verified secret implies a session was read under a valid id
        let id = SessionId::parse(candidate)
            .ok_or_else(|| Error::validation("expected a valid session id"))?;

        let tokens = self.provider.exchange_code(code, redirect_uri).await?;
        let mut fresh = SessionRecord::default();
        tokens.apply_to(&mut fresh);
        self.sessions.set(&id, &fresh).await?;

        info!("Login completed");
        Ok(id)
    }

    /// End the local session and return the provider logout redirect.
    pub async fn logout(&self, candidate: Option<&str>, return_to: &str) -> Result<Url> {
        self.clear_session(candidate).await?;
        Ok(logout_url(&self.provider_config, return_to))
    }

    /// Profile of the caller, or `None` without an authenticated session.
    pub async fn user_info(&self, candidate: Option<&str>) -> Result<Option<UserInfo>> {
        match self.current_user(candidate).await? {
            Some(user) => Ok(Some(self.provider.user_info(&user.access_token).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::storage::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockProvider {
        refresh_calls: AtomicUsize,
        exchange_calls: AtomicUsize,
        refreshed: Mutex<Option<TokenSet>>,
        refresh_delay: Option<Duration>,
    }

    impl MockProvider {
        fn returning(tokens: TokenSet) -> Self {
            Self {
                refreshed: Mutex::new(Some(tokens)),
                ..Self::default()
            }
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityProvider for MockProvider {
        async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenSet> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenSet {
                access_token: format!("access-for-{code}"),
                id_token: "id".to_string(),
                refresh_token: Some("rt".to_string()),
                expires: now_millis() + 3_600_000,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.refresh_delay {
                tokio::time::sleep(delay).await;
            }
            let tokens = self.refreshed.lock().unwrap().clone();
            tokens.ok_or_else(|| Error::Provider {
                endpoint: "mock".to_string(),
                error: "invalid_grant".to_string(),
                description: None,
            })
        }

        async fn user_info(&self, access_token: &str) -> Result<UserInfo> {
            UserInfo::from_body(
                json!({
                    "sub": access_token,
                    "name": "n",
                    "nickname": "n",
                    "picture": "p",
                    "email": "e",
                    "email_verified": false,
                    "updated_at": "2024-01-01T00:00:00Z"
                })
                .as_object()
                .unwrap()
                .clone(),
            )
        }
    }

    fn coordinator(provider: Arc<MockProvider>) -> (TokenCoordinator, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(backend.clone(), &SessionConfig::new("secret", "salt")).unwrap();
        let provider_config =
            ProviderConfig::new("client", "secret", "https://tenant.auth.example.com").unwrap();
        let coordinator = TokenCoordinator::new(
            sessions,
            provider,
            provider_config,
            CoordinatorConfig::default(),
        );
        (coordinator, backend)
    }

    fn session_with(expires: i64) -> SessionRecord {
        SessionRecord {
            access_token: Some("old".to_string()),
            id_token: Some("old-id".to_string()),
            refresh_token: Some("rt".to_string()),
            expires: Some(expires),
            ..SessionRecord::default()
        }
    }

    fn refreshed_tokens() -> TokenSet {
        TokenSet {
            access_token: "new".to_string(),
            id_token: "new2".to_string(),
            refresh_token: None,
            expires: now_millis() + 1000,
        }
    }

    #[tokio::test]
    async fn test_no_user_without_session() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider.clone());

        assert!(coordinator.current_user(None).await.unwrap().is_none());
        assert!(coordinator.current_user(Some("garbage")).await.unwrap().is_none());

        let unknown = SessionId::generate();
        assert!(coordinator.current_user(Some(unknown.as_str())).await.unwrap().is_none());

        let pending = coordinator
            .save_session(None, &SessionRecord::pending_login("secret"))
            .await
            .unwrap();
        assert!(coordinator.current_user(Some(pending.as_str())).await.unwrap().is_none());
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_fresh_tokens_not_refreshed() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider.clone());
        let id = coordinator
            .save_session(None, &session_with(now_millis() + 3_600_000))
            .await
            .unwrap();

        let user = coordinator.current_user(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(user.access_token, "old");
        assert!(user.expires_in > 3_500_000);
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_signed_out() {
        let provider = Arc::new(MockProvider::returning(refreshed_tokens()));
        let (coordinator, _) = coordinator(provider.clone());

        let mut record = session_with(now_millis() - 1);
        record.refresh_token = None;
        let id = coordinator.save_session(None, &record).await.unwrap();
        assert!(coordinator.current_user(Some(id.as_str())).await.unwrap().is_none());

        let mut record = session_with(now_millis() - 1);
        record.refresh_token = None;
        record.expires = None;
        let id = coordinator.save_session(None, &record).await.unwrap();
        assert!(coordinator.current_user(Some(id.as_str())).await.unwrap().is_none());

        // Inside the margin the token still works until it really expires
        let mut record = session_with(now_millis() + 60_000);
        record.refresh_token = None;
        let id = coordinator.save_session(None, &record).await.unwrap();
        let user = coordinator.current_user(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(user.access_token, "old");
        assert!(user.expires_in > 0);

        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_refreshed_and_merged() {
        let provider = Arc::new(MockProvider::returning(refreshed_tokens()));
        let (coordinator, _) = coordinator(provider.clone());

        let mut record = session_with(now_millis() - 1);
        record.extra.insert("cart".to_string(), json!([1]));
        let id = coordinator.save_session(None, &record).await.unwrap();

        let user = coordinator.current_user(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(user.access_token, "new");
        assert_eq!(user.id_token.as_deref(), Some("new2"));
        assert!(user.expires_in > 900 && user.expires_in <= 1000, "{}", user.expires_in);

        let stored = coordinator.session(Some(id.as_str())).await.unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("new"));
        assert_eq!(stored.id_token.as_deref(), Some("new2"));
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
        assert_eq!(stored.extra.get("cart"), Some(&json!([1])));
        assert_eq!(provider.refresh_calls(), 1);

        // Lock was released
        let lock = DistributedLock::new(coordinator.sessions().backend().clone(), "salt");
        assert!(lock.lock(&id, Duration::from_secs(5)).await.acquired());
    }

    #[tokio::test]
    async fn test_lock_contention_uses_stale_record() {
        let provider = Arc::new(MockProvider::returning(refreshed_tokens()));
        let (coordinator, backend) = coordinator(provider.clone());
        let record = session_with(now_millis() - 1);
        let id = coordinator.save_session(None, &record).await.unwrap();

        let other_holder = DistributedLock::new(backend.clone(), "salt")
            .lock(&id, Duration::from_secs(5))
            .await;
        assert!(other_holder.acquired());

        let user = coordinator.current_user(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(user.access_token, "old");
        assert_eq!(provider.refresh_calls(), 0);
        assert_eq!(coordinator.session(Some(id.as_str())).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_failed_refresh_preserves_record() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, backend) = coordinator(provider.clone());
        let record = session_with(now_millis() - 1);
        let id = coordinator.save_session(None, &record).await.unwrap();

        let err = coordinator.current_user(Some(id.as_str())).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert_eq!(coordinator.session(Some(id.as_str())).await.unwrap(), record);

        // Released on the error path too
        let lock_key = DistributedLock::new(backend.clone(), "salt").lock_key(&id);
        assert!(!backend.exists(&lock_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_requests_refresh_once() {
        let provider = Arc::new(MockProvider {
            refresh_delay: Some(Duration::from_millis(50)),
            ..MockProvider::returning(refreshed_tokens())
        });
        let (coordinator, _) = coordinator(provider.clone());
        let id = coordinator
            .save_session(None, &session_with(now_millis() - 1))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            coordinator.current_user(Some(id.as_str())),
            coordinator.current_user(Some(id.as_str()))
        );

        let mut tokens = vec![a.unwrap().unwrap().access_token, b.unwrap().unwrap().access_token];
        tokens.sort();
        assert_eq!(tokens, vec!["new", "old"]);
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_login_roundtrip() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider.clone());

        let start = coordinator
            .begin_login(Some("not-a-session"), "https://app/callback", &["read:orders"])
            .await
            .unwrap();
        let state: String = start
            .redirect
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let pending = coordinator.session(Some(start.session_id.as_str())).await.unwrap();
        assert!(pending.csrf_secret.is_some());

        let id = coordinator
            .complete_login(start.session_id.as_str(), Some(&state), Some("abc"), "https://app/callback")
            .await
            .unwrap();
        assert_eq!(id, start.session_id);

        let stored = coordinator.session(Some(id.as_str())).await.unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("access-for-abc"));
        assert!(stored.csrf_secret.is_none());

        let user = coordinator.current_user(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(user.access_token, "access-for-abc");
        let info = coordinator.user_info(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(info.sub, "access-for-abc");
    }

    #[tokio::test]
    async fn test_forged_callback_deletes_session() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider.clone());

        let start = coordinator
            .begin_login::<&str>(None, "https://app/callback", &[])
            .await
            .unwrap();
        let forged = csrf::generate().token;

        let err = coordinator
            .complete_login(start.session_id.as_str(), Some(&forged), Some("abc"), "https://app/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Csrf(csrf::CsrfError::Mismatch)));
        assert!(!coordinator.sessions().has(start.session_id.as_str()).await.unwrap());
        assert_eq!(provider.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callback_without_state_or_secret() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider.clone());

        let start = coordinator
            .begin_login::<&str>(None, "https://app/callback", &[])
            .await
            .unwrap();
        let err = coordinator
            .complete_login(start.session_id.as_str(), None, Some("abc"), "https://app/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Csrf(csrf::CsrfError::MissingToken)));

        let err = coordinator
            .complete_login("no-session", Some("state"), Some("abc"), "https://app/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Csrf(csrf::CsrfError::MissingSecret)));
        assert_eq!(provider.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let provider = Arc::new(MockProvider::default());
        let (coordinator, _) = coordinator(provider);
        let id = coordinator
            .save_session(None, &session_with(now_millis() + 3_600_000))
            .await
            .unwrap();

        let url = coordinator
            .logout(Some(id.as_str()), "https://app.example.com/")
            .await
            .unwrap();
        assert_eq!(url.path(), "/v2/logout");
        assert!(coordinator.session(Some(id.as_str())).await.unwrap().is_empty());
        assert!(coordinator.user_info(Some(id.as_str())).await.unwrap().is_none());
    }
}
