//! Identity provider access: token grants, userinfo, redirects and throttling.

pub mod client;
pub mod rate_limit;
pub mod response;
pub mod service;
pub mod token;
pub mod urls;
pub mod userinfo;

pub use client::ProviderClient;
pub use rate_limit::RateLimiter;
pub use response::{ProviderErrorBody, ProviderResponse};
pub use service::ServiceTokenCache;
pub use token::{IdentityProvider, ServiceToken, TokenSet};
pub use urls::{authorize_url, logout_url, AuthorizeRedirect};
pub use userinfo::UserInfo;
