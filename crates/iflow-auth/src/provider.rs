//! `OAuthProvider` implementation backed by the real iFlow endpoints
//!
//! One refresh in the pool's sense is two provider calls: the token-grant
//! refresh, then the user-info lookup that mints the inference api key.
//! Both must succeed for the credential to be considered renewed.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;
use upstream::{OAuthError, OAuthProvider, RefreshedCredential};

use crate::error::Error;
use crate::token::{fetch_user_info, refresh_token};

/// Production OAuth provider.
pub struct IFlowOAuth {
    client: reqwest::Client,
}

impl IFlowOAuth {
    pub fn new() -> Result<Self, OAuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OAuthError::Http(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

impl OAuthProvider for IFlowOAuth {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedCredential, OAuthError>> + Send + 'a>> {
        Box::pin(async move {
            let token = refresh_token(&self.client, refresh)
                .await
                .map_err(map_auth_error)?;

            let user_info = fetch_user_info(&self.client, &token.access_token)
                .await
                .map_err(map_auth_error)?;

            let api_key = user_info
                .inference_key()
                .ok_or_else(|| OAuthError::Protocol("user info carries no api key".into()))?
                .to_string();

            debug!("oauth refresh resolved a fresh inference key");

            Ok(RefreshedCredential {
                api_key,
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_at_ms: now_millis() + token.expires_in * 1000,
            })
        })
    }
}

fn map_auth_error(e: Error) -> OAuthError {
    match e {
        Error::InvalidCredentials(msg) => OAuthError::InvalidGrant(msg),
        Error::Http(msg) => OAuthError::Http(msg),
        Error::TokenExchange(msg) | Error::UserInfo(msg) => OAuthError::Protocol(msg),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
