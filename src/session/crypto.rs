//! Session payload encryption.
//!
//! Blob format: `base64(IV[16] || AES-256-CTR(plaintext))`, keyed by
//! `sha256(password)`. The record password is `id + salt + secret` while the
//! storage address is `sha256(id + salt)`, so the address never reveals the key.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const IV_LEN: usize = 16;

/// Why a payload could not be encrypted or decrypted.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key must be a non-empty string")]
    EmptyKey,
    #[error("plaintext must be a non-empty string")]
    EmptyPlaintext,
    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("payload of {0} bytes is too short to hold an IV and ciphertext")]
    TooShort(usize),
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload envelope is not valid JSON: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// Concatenate key material.
pub fn salt_key(parts: &[&str]) -> String {
    parts.concat()
}

/// Storage address for a session: `base64(sha256(id + salt))`.
pub fn storage_key(id: &str, salt: &str) -> String {
    BASE64.encode(Sha256::digest(salt_key(&[id, salt]).as_bytes()))
}

/// Password from which a record's encryption key is derived.
pub fn record_password(id: &str, salt: &str, secret: &str) -> String {
    salt_key(&[id, salt, secret])
}

/// Encrypt `plaintext` under `sha256(key)` with a fresh random IV.
pub fn encrypt(key: &str, plaintext: &str) -> Result<String, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::EmptyKey);
    }
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }

    let digest = Sha256::digest(key.as_bytes());
    let iv: [u8; IV_LEN] = rand::random();

    let mut buf = plaintext.as_bytes().to_vec();
    let mut cipher = Aes256Ctr::new(&digest, GenericArray::from_slice(&iv));
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(IV_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(BASE64.encode(out))
}

/// Decrypt a blob produced by [`encrypt`], reporting why it failed.
pub fn try_decrypt(key: &str, blob: &str) -> Result<String, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::EmptyKey);
    }

    let input = BASE64.decode(blob)?;
    if input.len() <= IV_LEN {
        return Err(CryptoError::TooShort(input.len()));
    }

    let digest = Sha256::digest(key.as_bytes());
    let (iv, ciphertext) = input.split_at(IV_LEN);

    let mut buf = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&digest, GenericArray::from_slice(iv));
    cipher.apply_keystream(&mut buf);

    String::from_utf8(buf).map_err(|_| CryptoError::InvalidUtf8)
}

/// Decrypt a blob, logging and returning `None` on any failure.
pub fn decrypt(key: &str, blob: &str) -> Option<String> {
    match try_decrypt(key, blob) {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            warn!(error = %e, "Failed to decrypt payload");
            None
        }
    }
}

#[derive(Serialize)]
struct SealEnvelope<'a, T> {
    data: &'a T,
}

#[derive(Deserialize)]
struct OpenEnvelope<T> {
    data: T,
}

/// Encrypt `data` wrapped as `{"data": ..}` under the record password.
pub fn encrypt_data<T: Serialize>(
    id: &str,
    salt: &str,
    secret: &str,
    data: &T,
) -> Result<String, CryptoError> {
    let json = serde_json::to_string(&SealEnvelope { data })?;
    encrypt(&record_password(id, salt, secret), &json)
}

/// Decrypt and unwrap a payload produced by [`encrypt_data`].
///
/// Tampered, truncated or foreign-key payloads yield `None` and a warning.
pub fn decrypt_data<T: DeserializeOwned>(
    id: &str,
    salt: &str,
    secret: &str,
    blob: &str,
) -> Option<T> {
    let plaintext = decrypt(&record_password(id, salt, secret), blob)?;
    match serde_json::from_str::<OpenEnvelope<T>>(&plaintext) {
        Ok(envelope) => Some(envelope.data),
        Err(e) => {
            warn!(error = %CryptoError::from(e), "Failed to open payload envelope");
            None
        }
    }
}
