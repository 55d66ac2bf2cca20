//! Userinfo endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::client::ProviderClient;
use crate::error::{Error, Result};
use crate::oidc::decode_unverified;

/// Rate-limit identity when the access token carries no subject.
const ANONYMOUS_LIMIT_ID: &str = "*";

/// Profile of the authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    pub name: String,
    pub nickname: String,
    pub picture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub email: String,
    pub email_verified: bool,
    pub updated_at: DateTime<Utc>,
    /// Any other profile claims.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn take_field(body: &mut Map<String, Value>, name: &str) -> Result<Value> {
    match body.remove(name) {
        Some(Value::Null) | None => Err(Error::validation(format!(
            "expected userinfo to have property '{name}'"
        ))),
        Some(value) => Ok(value),
    }
}

fn take_string(body: &mut Map<String, Value>, name: &str) -> Result<String> {
    match take_field(body, name)? {
        Value::String(s) => Ok(s),
        other => Err(Error::validation(format!(
            "expected userinfo.{name} to be a string, but got {}",
            type_name(&other)
        ))),
    }
}

fn take_bool(body: &mut Map<String, Value>, name: &str) -> Result<bool> {
    match take_field(body, name)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::validation(format!(
            "expected userinfo.{name} to be a boolean, but got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl UserInfo {
    /// Validate a userinfo body field by field.
    pub fn from_body(mut body: Map<String, Value>) -> Result<Self> {
        let sub = take_string(&mut body, "sub")?;
        let name = take_string(&mut body, "name")?;
        let nickname = take_string(&mut body, "nickname")?;
        let picture = take_string(&mut body, "picture")?;
        let email = take_string(&mut body, "email")?;
        let email_verified = take_bool(&mut body, "email_verified")?;

        let updated_at = take_string(&mut body, "updated_at")?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| {
                Error::validation(format!(
                    "expected userinfo.updated_at to be an RFC 3339 timestamp: {e}"
                ))
            })?
            .with_timezone(&Utc);

        let locale = match body.remove("locale") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        Ok(Self {
            sub,
            name,
            nickname,
            picture,
            locale,
            email,
            email_verified,
            updated_at,
            extra: body,
        })
    }
}

impl ProviderClient {
    /// Fetch the profile behind an access token.
    ///
    /// Throttled per token subject; opaque tokens share one budget.
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo> {
        let limit_id = decode_unverified(access_token)
            .ok()
            .and_then(|claims| claims.sub)
            .unwrap_or_else(|| ANONYMOUS_LIMIT_ID.to_string());

        let endpoint = &self.config.urls.userinfo;
        debug!(url = %endpoint, "Fetching userinfo");

        let response = self
            .send_throttled(&self.userinfo_limiter, &limit_id, |http| {
                http.get(endpoint.clone()).bearer_auth(access_token)
            })
            .await?;
        let body: Map<String, Value> = Self::read_body(endpoint, response).await?;

        UserInfo::from_body(body)
    }
}
