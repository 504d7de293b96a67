//! Collaborator interfaces consumed by the account-pool core
//!
//! Defines the `Upstream` trait (completion transport) and the
//! `OAuthProvider` trait (token renewal), decoupling pool logic from HTTP
//! specifics so orchestrator and refresher tests can script outcomes.
//! `HttpUpstream` is the production reqwest-backed implementation.
//!
//! Error classification lives here because both the transport and the pool
//! need to agree on what "retryable" and "token expired" mean.

pub mod http;

pub use http::HttpUpstream;

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Credential material for one upstream attempt.
///
/// Cloned out of the registry at attempt time so a concurrent token refresh
/// never mutates a request mid-flight.
#[derive(Clone)]
pub struct AccountAuth {
    pub api_key: Secret<String>,
    pub base_url: String,
}

/// How an upstream failure presented itself at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request or connect timeout
    Timeout,
    /// Connection-level failure (refused, reset, DNS)
    Transport,
    /// Upstream answered with a non-success status or error payload
    Status,
}

/// A classified upstream failure.
///
/// `status` is present for `Status` errors, including iFlow's JSON
/// payload-level errors that arrive with HTTP 200 but a non-zero `status`
/// field in the body.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream error: {message}")]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            status: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport,
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Status,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether this failure should be retried (locally or on another
    /// account). Timeouts and transport failures always are; status errors
    /// only when the code is in the configured retry set.
    pub fn is_retryable(&self, retry_status_codes: &[u16]) -> bool {
        match self.kind {
            ErrorKind::Timeout | ErrorKind::Transport => true,
            ErrorKind::Status => self
                .status
                .map(|s| retry_status_codes.contains(&s))
                .unwrap_or(false),
        }
    }

    /// Detect iFlow "API Token expired" responses.
    ///
    /// Observed as HTTP 439, or as 400/401/403 with a token-expiry message
    /// in the error body.
    pub fn is_token_expired(&self) -> bool {
        match self.status {
            Some(439) => true,
            Some(400) | Some(401) | Some(403) => {
                let msg = self.message.to_lowercase();
                (msg.contains("token") && msg.contains("expired"))
                    || (msg.contains("api token") && msg.contains("expire"))
            }
            _ => false,
        }
    }
}

/// Upstream completion transport.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Upstream>`), same shape as the auth provider seam.
pub trait Upstream: Send + Sync {
    /// Send a chat-completions request with the given account credential.
    fn chat_completions<'a>(
        &'a self,
        auth: &'a AccountAuth,
        body: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, UpstreamError>> + Send + 'a>>;
}

/// A freshly renewed OAuth credential set.
///
/// iFlow mints the inference `api_key` from the OAuth session, so a refresh
/// yields both the OAuth tokens and the request credential.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub api_key: String,
    pub access_token: String,
    /// Present when the provider rotated the refresh token
    pub refresh_token: Option<String>,
    /// Absolute expiry, unix millis
    pub expires_at_ms: u64,
}

/// Errors from the OAuth provider.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Refresh token revoked or expired; retrying with the same token is pointless
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

/// OAuth token renewal provider.
pub trait OAuthProvider: Send + Sync {
    /// Exchange a refresh token for a renewed credential set.
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedCredential, OAuthError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY_CODES: &[u16] = &[429, 500, 502, 503, 504];

    #[test]
    fn timeout_is_retryable() {
        let err = UpstreamError::timeout("deadline exceeded");
        assert!(err.is_retryable(RETRY_CODES));
    }

    #[test]
    fn transport_is_retryable() {
        let err = UpstreamError::transport("connection refused");
        assert!(err.is_retryable(RETRY_CODES));
    }

    #[test]
    fn status_in_retry_set_is_retryable() {
        for code in [429u16, 500, 502, 503, 504] {
            let err = UpstreamError::status(code, "boom");
            assert!(err.is_retryable(RETRY_CODES), "code {code} must retry");
        }
    }

    #[test]
    fn status_outside_retry_set_is_fatal() {
        for code in [400u16, 401, 403, 404, 422] {
            let err = UpstreamError::status(code, "rejected");
            assert!(!err.is_retryable(RETRY_CODES), "code {code} must not retry");
        }
    }

    #[test]
    fn empty_retry_set_makes_all_statuses_fatal() {
        let err = UpstreamError::status(503, "unavailable");
        assert!(!err.is_retryable(&[]));
        // Transport failures stay retryable regardless of the set
        assert!(UpstreamError::timeout("t").is_retryable(&[]));
    }

    #[test]
    fn status_439_is_token_expired() {
        let err = UpstreamError::status(439, "Your API Token has expired");
        assert!(err.is_token_expired());
    }

    #[test]
    fn status_401_with_expiry_message_is_token_expired() {
        let err = UpstreamError::status(401, r#"{"msg":"API Token expired, please re-login"}"#);
        assert!(err.is_token_expired());
    }

    #[test]
    fn status_401_without_expiry_message_is_not_token_expired() {
        let err = UpstreamError::status(401, "invalid api key");
        assert!(!err.is_token_expired());
    }

    #[test]
    fn status_500_is_never_token_expired() {
        let err = UpstreamError::status(500, "token expired"); // message alone is not enough
        assert!(!err.is_token_expired());
    }

    #[test]
    fn account_auth_debug_redacts_key() {
        let auth = AccountAuth {
            api_key: Secret::new("sk-super-secret".to_string()),
            base_url: "https://apis.iflow.cn/v1".into(),
        };
        let debug = format!("{:?}", auth.api_key);
        assert!(!debug.contains("sk-super-secret"));
    }
}
