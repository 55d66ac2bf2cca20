//! OIDC token verification with JWKS support.
//!
//! Tokens from the provider are verified against its published key set on
//! receipt; tokens read back from the session store are only decoded.

pub mod claims;
pub mod jwks;
pub mod verifier;

pub use claims::{decode_unverified, Audience, DecodedJwt};
pub use jwks::JwksCache;
pub use verifier::{Verifier, VerifierCache};
