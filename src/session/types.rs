//! Session identifiers and records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Length of a hyphenated UUID.
const SESSION_ID_LEN: usize = 36;

/// A structurally valid session identifier (UUIDv4-shaped, case-insensitive).
///
/// Only values of this type address storage; anything else is "no session".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Whether `candidate` is exactly 36 characters of hex digits and hyphens.
    pub fn is_valid(candidate: &str) -> bool {
        candidate.len() == SESSION_ID_LEN
            && candidate
                .bytes()
                .all(|b| b.is_ascii_hexdigit() || b == b'-')
    }

    /// Accept a candidate (usually a cookie value) if it is structurally valid.
    pub fn parse(candidate: &str) -> Option<Self> {
        Self::is_valid(candidate).then(|| Self(candidate.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The decrypted content of a session.
///
/// Depending on the flow stage it carries the CSRF secret of a pending login or
/// the token set of an authenticated user. Unknown fields are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token expiry in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,

    /// Application data stored alongside the tokens.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionRecord {
    /// A record holding only the CSRF secret of a pending login.
    pub fn pending_login(csrf_secret: impl Into<String>) -> Self {
        Self {
            csrf_secret: Some(csrf_secret.into()),
            ..Self::default()
        }
    }

    /// Whether the record carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
