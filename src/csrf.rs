//! Anti-forgery pairing for the authorization-code flow.
//!
//! The secret stays server-side in the session; the token travels through the
//! provider as the `state` parameter. A token is `salt-hash` where
//! `hash = base64url(sha256(salt-secret))`, so many tokens can be minted for
//! one secret and none of them reveals it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const SECRET_BYTES: usize = 18;
const SALT_LEN: usize = 8;

/// A matched secret and token for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfPair {
    pub secret: String,
    pub token: String,
}

/// Why a CSRF pair was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsrfError {
    #[error("CSRF secret is missing from the session")]
    MissingSecret,
    #[error("CSRF token is missing from the callback")]
    MissingToken,
    #[error("CSRF token does not match the session secret")]
    Mismatch,
}

/// Create a fresh secret and a token bound to it.
pub fn generate() -> CsrfPair {
    let secret_bytes: [u8; SECRET_BYTES] = rand::random();
    let secret = URL_SAFE_NO_PAD.encode(secret_bytes);
    let token = create_token(&secret);
    CsrfPair { secret, token }
}

/// Mint a token for an existing secret.
pub fn create_token(secret: &str) -> String {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();
    format!("{salt}-{}", token_hash(&salt, secret))
}

fn token_hash(salt: &str, secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(format!("{salt}-{secret}").as_bytes()))
}

/// Check a token against a secret.
///
/// Missing secret is reported before missing token, and neither case reaches
/// the hash comparison.
pub fn verify(secret: Option<&str>, token: Option<&str>) -> Result<(), CsrfError> {
    let secret = secret.filter(|s| !s.is_empty()).ok_or(CsrfError::MissingSecret)?;
    let token = token.filter(|t| !t.is_empty()).ok_or(CsrfError::MissingToken)?;

    let (salt, presented) = token.split_once('-').ok_or(CsrfError::Mismatch)?;
    let expected = token_hash(salt, secret);

    if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(CsrfError::Mismatch)
    }
}

impl CsrfPair {
    /// Verify this pair.
    pub fn verify(&self) -> Result<(), CsrfError> {
        verify(Some(&self.secret), Some(&self.token))
    }
}
