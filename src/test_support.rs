//! Signing keys and a mock provider for unit tests.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::ProviderConfig;

pub const TEST_KID: &str = "test-key-1";
pub const TEST_PRIVATE_PEM: &str = include_str!("../tests/fixtures/rsa_private.pem");
pub const TEST_CERT_X5C: &str = include_str!("../tests/fixtures/rsa_cert.x5c");
const TEST_JWK: &str = include_str!("../tests/fixtures/rsa_public.jwk.json");

pub fn test_jwk() -> Value {
    serde_json::from_str(TEST_JWK).unwrap()
}

/// Sign claims with the fixture key (RS256, kid `test-key-1`).
pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TEST_KID.to_string());
    let key = EncodingKey::from_rsa_pem(TEST_PRIVATE_PEM.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// `iss` and `exp` (Unix seconds) merged with `extra`.
pub fn token_claims(issuer: &str, exp: i64, extra: Value) -> Value {
    let mut claims = json!({ "iss": issuer, "exp": exp, "aud": "test-client" });
    if let (Some(target), Value::Object(extra)) = (claims.as_object_mut(), extra) {
        target.extend(extra);
    }
    claims
}

/// Serve the fixture key set from `server`.
pub async fn mount_jwks(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [test_jwk()] })))
        .mount(server)
        .await;
}

/// A mock provider serving the fixture JWKS, and a config pointing at it.
pub async fn provider() -> (MockServer, ProviderConfig) {
    let server = MockServer::start().await;
    mount_jwks(&server).await;
    let config = ProviderConfig::new("test-client", "test-secret", server.uri()).unwrap();
    (server, config)
}
