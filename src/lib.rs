//! Zentinel OIDC session core.
//!
//! Encrypted server-side sessions, cluster-safe refresh of expiring OIDC
//! tokens, provider rate limiting, JWKS-backed token verification and CSRF
//! protection of the authorization-code flow.
//!
//! The crate does no cookie handling and no HTTP status mapping: hosts pass
//! the session cookie value in and map [`Error`] to responses themselves.

pub mod config;
pub mod coordinator;
pub mod csrf;
pub mod error;
pub mod oidc;
pub mod provider;
pub mod session;
pub mod single_flight;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use config::{CoordinatorConfig, ProviderConfig, ProviderSettings, SessionConfig};
pub use coordinator::{CurrentUser, LoginStart, TokenCoordinator};
pub use error::{Error, Result, TokenKind};
pub use provider::{IdentityProvider, ProviderClient, ServiceTokenCache};
pub use session::{SessionId, SessionRecord, SessionStore};
pub use storage::{KeyValueStore, MemoryStore, RedbStore};

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
