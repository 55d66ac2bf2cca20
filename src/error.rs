//! Error taxonomy for session and token operations.
//!
//! Decryption failures never appear here: a corrupted or foreign session
//! payload is logged and treated as "no session". Lock contention is not an
//! error either, see [`LockHandle`](crate::session::LockHandle).

use std::fmt;

use crate::csrf::CsrfError;

/// Which of the two tokens in an OIDC response failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Id,
    Access,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Id => write!(f, "id token"),
            TokenKind::Access => write!(f, "access token"),
        }
    }
}

/// Errors returned by the session and token lifecycle core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The provider answered with a body that is missing a field or has the wrong shape.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider answered with a structured `{error, error_description}` body
    /// or an error status.
    #[error("provider error on '{endpoint}': {error}{}", describe(.description))]
    Provider {
        endpoint: String,
        error: String,
        description: Option<String>,
    },

    /// A JWT failed signature, issuer or key resolution checks.
    #[error("token verification failed ({token}): {source}")]
    Verification {
        token: TokenKind,
        #[source]
        source: anyhow::Error,
    },

    /// The authorization callback did not carry a valid anti-forgery pair.
    #[error(transparent)]
    Csrf(#[from] CsrfError),

    /// The provider kept answering 429 after every allowed attempt.
    #[error("rate limited by provider after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Network failure talking to the provider.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The keyed storage collaborator failed.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(", {d}"))
        .unwrap_or_default()
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn verification(token: TokenKind, source: anyhow::Error) -> Self {
        Self::Verification { token, source }
    }
}
