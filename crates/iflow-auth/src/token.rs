//! OAuth token exchange, refresh, and user-info lookup
//!
//! The token endpoint takes form-encoded grants authenticated with HTTP
//! Basic auth (client id:secret). Unlike most providers, iFlow's inference
//! credential is not the OAuth access token itself: the `apiKey` comes from
//! the user-info endpoint and must be re-fetched after every refresh.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::constants::{IFLOW_CLIENT_ID, IFLOW_CLIENT_SECRET, TOKEN_ENDPOINT, USER_INFO_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Callers
/// convert it to an absolute unix millisecond timestamp when storing the
/// credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent when the provider keeps the existing refresh token valid
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// User profile fields the gateway cares about.
///
/// `api_key` is the inference credential; `search_api_key` is a fallback
/// some account tiers return instead.
#[derive(Debug, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(rename = "searchApiKey")]
    pub search_api_key: Option<String>,
}

impl UserInfo {
    /// The usable inference key, preferring `apiKey` over `searchApiKey`.
    pub fn inference_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .or_else(|| self.search_api_key.as_deref().filter(|k| !k.is_empty()))
    }
}

/// Envelope around the user-info payload.
#[derive(Debug, Deserialize)]
struct UserInfoEnvelope {
    success: Option<bool>,
    data: Option<UserInfo>,
}

fn basic_auth() -> String {
    let credentials = BASE64.encode(format!("{IFLOW_CLIENT_ID}:{IFLOW_CLIENT_SECRET}"));
    format!("Basic {credentials}")
}

/// Exchange an authorization code for tokens (initial login flow).
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .header(reqwest::header::AUTHORIZATION, basic_auth())
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", IFLOW_CLIENT_ID),
            ("client_secret", IFLOW_CLIENT_SECRET),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// A 400 with `invalid_grant` means the refresh token is revoked or
/// expired; this maps to `InvalidCredentials` so callers can stop retrying
/// with the same token.
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .header(reqwest::header::AUTHORIZATION, basic_auth())
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", IFLOW_CLIENT_ID),
            ("client_secret", IFLOW_CLIENT_SECRET),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 400 && body.contains("invalid_grant") {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected: {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

/// Fetch the user profile for an access token, including the inference
/// api key.
pub async fn fetch_user_info(client: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
    let response = client
        .get(format!("{USER_INFO_ENDPOINT}?accessToken={access_token}"))
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::Http(format!("user info request failed: {e}")))?;

    let status = response.status();
    if status.as_u16() == 401 {
        return Err(Error::InvalidCredentials(
            "access token invalid or expired".into(),
        ));
    }
    if !status.is_success() {
        return Err(Error::UserInfo(format!(
            "user info endpoint returned {status}"
        )));
    }

    let envelope: UserInfoEnvelope = response
        .json()
        .await
        .map_err(|e| Error::UserInfo(format!("invalid user info response: {e}")))?;

    match (envelope.success, envelope.data) {
        (Some(true), Some(data)) => Ok(data),
        _ => Err(Error::UserInfo("user info response missing data".into())),
    }
}
