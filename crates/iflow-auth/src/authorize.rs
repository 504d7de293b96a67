//! Authorization URL construction for the browser login flow

use rand::RngExt;
use rand::distr::Alphanumeric;

use crate::constants::AUTHORIZE_ENDPOINT;

/// Build the iFlow authorization URL for a browser login.
///
/// When `state` is `None` a random CSRF token is generated; the caller
/// must check it against the `state` query parameter on the callback.
/// Returns the URL and the state actually used.
pub fn build_authorization_url(redirect_uri: &str, state: Option<&str>) -> (String, String) {
    let state = match state {
        Some(s) => s.to_string(),
        None => rand::rng()
            .sample_iter(Alphanumeric)
            .take(22)
            .map(char::from)
            .collect(),
    };

    let url = format!(
        "{AUTHORIZE_ENDPOINT}?client_id={}&loginMethod=phone&type=phone&redirect={redirect_uri}&state={state}",
        crate::constants::IFLOW_CLIENT_ID,
    );
    (url, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_contains_client_id_and_redirect() {
        let (url, _) = build_authorization_url("http://localhost:11451/oauth2callback", None);
        assert!(url.starts_with("https://iflow.cn/oauth?"));
        assert!(url.contains("client_id=10009311001"));
        assert!(url.contains("redirect=http://localhost:11451/oauth2callback"));
    }

    #[test]
    fn explicit_state_is_used_verbatim() {
        let (url, state) = build_authorization_url("http://localhost/cb", Some("my-state"));
        assert_eq!(state, "my-state");
        assert!(url.ends_with("state=my-state"));
    }

    #[test]
    fn generated_state_is_random_and_nonempty() {
        let (_, a) = build_authorization_url("http://localhost/cb", None);
        let (_, b) = build_authorization_url("http://localhost/cb", None);
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
    }
}
