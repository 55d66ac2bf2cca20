//! Typed provider responses.
//!
//! Every provider answer is either a structured error `{error,
//! error_description}` or a success body. Structured errors win over the
//! status code; an error status without one becomes `got status N`.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Structured error body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// A provider answer, discriminated by the presence of `error`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProviderResponse<T> {
    Error(ProviderErrorBody),
    Success(T),
}

fn provider_error(endpoint: &Url, error: String, description: Option<String>) -> Error {
    Error::Provider {
        endpoint: endpoint.to_string(),
        error,
        description,
    }
}

/// Classify a response body from `endpoint`.
pub fn verify_response<T: DeserializeOwned>(
    endpoint: &Url,
    status: StatusCode,
    body: &[u8],
) -> Result<T> {
    let is_error_status = status.is_client_error() || status.is_server_error();

    let parsed = match serde_json::from_slice::<ProviderResponse<T>>(body) {
        Ok(parsed) => parsed,
        Err(_) if is_error_status => {
            return Err(provider_error(
                endpoint,
                format!("got status {}", status.as_u16()),
                None,
            ));
        }
        Err(e) => return Err(Error::validation(format!("malformed response body: {e}"))),
    };

    match parsed {
        ProviderResponse::Error(body) => Err(provider_error(
            endpoint,
            body.error,
            body.error_description,
        )),
        ProviderResponse::Success(_) if is_error_status => Err(provider_error(
            endpoint,
            format!("got status {}", status.as_u16()),
            None,
        )),
        ProviderResponse::Success(value) => Ok(value),
    }
}
