//! Decoded JWT claims and local, non-verifying decoding.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Audience can be a single string or array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::None => false,
            Audience::Single(s) => s == aud,
            Audience::Multiple(v) => v.iter().any(|a| a == aud),
        }
    }
}

/// Claims of an id or access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedJwt {
    /// Expiration time (Unix seconds)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience (can be string or array)
    #[serde(default)]
    pub aud: Audience,
    /// Subject (user identifier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Scopes (space-separated string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Additional claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DecodedJwt {
    /// Scopes as a list.
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Expiry in Unix milliseconds.
    pub fn expires_at_ms(&self) -> i64 {
        self.exp.saturating_mul(1000)
    }
}

/// Decode the payload of a compact JWT without checking its signature.
///
/// Only for tokens this process verified earlier (e.g. read back from the
/// session store).
pub fn decode_unverified(token: &str) -> Result<DecodedJwt> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(anyhow!("Token is not a compact JWT")),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("Failed to decode token payload")?;
    serde_json::from_slice(&bytes).context("Failed to parse token claims")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compact(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn test_decode_unverified() {
        let token = compact(&json!({
            "exp": 1_700_000_000,
            "iss": "https://auth.example.com/",
            "aud": ["https://api.example.com", "https://auth.example.com/userinfo"],
            "sub": "user|123",
            "scope": "openid profile",
            "azp": "client"
        }));

        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.exp, 1_700_000_000);
        assert_eq!(claims.expires_at_ms(), 1_700_000_000_000);
        assert_eq!(claims.sub.as_deref(), Some("user|123"));
        assert!(claims.aud.contains("https://api.example.com"));
        assert_eq!(claims.scopes(), vec!["openid", "profile"]);
        assert_eq!(claims.extra.get("azp"), Some(&json!("client")));
    }

    #[test]
    fn test_single_audience() {
        let token = compact(&json!({ "exp": 1, "iss": "i", "aud": "client" }));
        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.aud, Audience::Single("client".to_string()));
        assert!(!claims.aud.contains("other"));
    }

    #[test]
    fn test_rejects_non_jwt() {
        assert!(decode_unverified("opaque-access-token").is_err());
        assert!(decode_unverified("a.b").is_err());
        assert!(decode_unverified("a.b.c.d").is_err());
        assert!(decode_unverified("a.!!!.c").is_err());
    }

    #[test]
    fn test_requires_exp_and_iss() {
        let token = compact(&json!({ "sub": "user" }));
        assert!(decode_unverified(&token).is_err());
    }
}
