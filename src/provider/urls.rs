//! Redirect URLs for login and logout.

use url::Url;

use crate::config::ProviderConfig;
use crate::csrf::{self, CsrfPair};

/// Where to send the browser to log in, and the CSRF pair bound to it.
#[derive(Debug, Clone)]
pub struct AuthorizeRedirect {
    pub csrf: CsrfPair,
    pub url: Url,
}

/// De-duplicated union of `requested` and `defaults`, first occurrence wins.
pub fn merge_scopes<S: AsRef<str>>(requested: &[S], defaults: &[String]) -> String {
    let mut scopes: Vec<&str> = Vec::new();
    for scope in requested
        .iter()
        .map(AsRef::as_ref)
        .chain(defaults.iter().map(String::as_str))
    {
        if !scope.is_empty() && !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    scopes.join(" ")
}

/// Build the authorization redirect for a fresh login attempt.
pub fn authorize_url<S: AsRef<str>>(
    config: &ProviderConfig,
    scopes: &[S],
    default_scopes: &[String],
    redirect_uri: &str,
) -> AuthorizeRedirect {
    let csrf = csrf::generate();

    let mut url = config.urls.authorization.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &merge_scopes(scopes, default_scopes))
        .append_pair("state", &csrf.token)
        .append_pair("audience", &config.audience);

    AuthorizeRedirect { csrf, url }
}

/// Build the provider logout redirect.
pub fn logout_url(config: &ProviderConfig, return_to: &str) -> Url {
    let mut url = config.urls.logout.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("client_id", &config.client_id)
        .append_pair("returnTo", return_to);
    url
}
