//! reqwest-backed upstream transport
//!
//! Talks to the iFlow OpenAI-compatible API. Beyond plain bearer auth, chat
//! requests carry the CLI-style signature headers some models require:
//! `session-id`, `conversation-id`, `x-iflow-timestamp`, and
//! `x-iflow-signature` (HMAC-SHA256 over `"iFlow-Cli:{session_id}:{ts}"`
//! keyed by the api key).
//!
//! iFlow sometimes reports business errors inside an HTTP 200 JSON payload
//! (`status`/`msg` fields); those are surfaced as status errors so the pool
//! can classify and fail over.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::{AccountAuth, Upstream, UpstreamError};

/// User-Agent expected by the iFlow API for CLI-tier model access.
const IFLOW_CLI_USER_AGENT: &str = "iFlow-Cli";

/// Production upstream transport.
///
/// One instance is shared by all accounts; the per-request credential comes
/// in via `AccountAuth`. Session and conversation ids are generated once per
/// process, matching the CLI's behavior of keeping a stable session.
pub struct HttpUpstream {
    client: reqwest::Client,
    session_id: String,
    conversation_id: String,
}

impl HttpUpstream {
    /// Build a transport with the given total request timeout.
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::transport(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            conversation_id: uuid::Uuid::new_v4().simple().to_string(),
        })
    }
}

impl Upstream for HttpUpstream {
    fn chat_completions<'a>(
        &'a self,
        auth: &'a AccountAuth,
        body: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/chat/completions",
                auth.base_url.trim_end_matches('/')
            );
            let timestamp_ms = now_millis().to_string();
            let signature = sign(auth.api_key.expose(), &self.session_id, &timestamp_ms);

            let response = self
                .client
                .post(&url)
                .bearer_auth(auth.api_key.expose())
                .header(reqwest::header::USER_AGENT, IFLOW_CLI_USER_AGENT)
                .header("session-id", &self.session_id)
                .header("conversation-id", &self.conversation_id)
                .header("x-iflow-timestamp", &timestamp_ms)
                .header("x-iflow-signature", &signature)
                .json(body)
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            let status = response.status();
            if !status.is_success() {
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(UpstreamError::status(status.as_u16(), text));
            }

            let mut payload: serde_json::Value = response
                .json()
                .await
                .map_err(|e| UpstreamError::transport(format!("reading response body: {e}")))?;

            if let Some(err) = payload_error(&payload) {
                debug!(status = ?err.status, "upstream returned error payload with HTTP 200");
                return Err(err);
            }

            ensure_usage(&mut payload);
            Ok(payload)
        })
    }
}

/// Map a reqwest send error to a classified transport failure.
fn classify_reqwest_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout(e.to_string())
    } else {
        UpstreamError::transport(e.to_string())
    }
}

/// HMAC-SHA256 request signature for the CLI-style chat headers.
fn sign(api_key: &str, session_id: &str, timestamp_ms: &str) -> String {
    let payload = format!("{IFLOW_CLI_USER_AGENT}:{session_id}:{timestamp_ms}");
    let mut mac = Hmac::<Sha256>::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Detect an error payload delivered with HTTP 200.
///
/// iFlow reports business errors as `{"status": <code>, "msg": "..."}`
/// where a `status` of 0 or 200 means success.
fn payload_error(payload: &serde_json::Value) -> Option<UpstreamError> {
    let obj = payload.as_object()?;
    let code = match obj.get("status") {
        Some(serde_json::Value::Number(n)) => n.as_u64()?,
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    if code == 0 || code == 200 {
        return None;
    }
    let msg = obj
        .get("msg")
        .or_else(|| obj.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .unwrap_or_else(|| format!("upstream error {code}"));
    Some(UpstreamError::status(code.min(u16::MAX as u64) as u16, msg))
}

/// Backfill a zeroed `usage` object for OpenAI-compatible clients that
/// require the field.
fn ensure_usage(payload: &mut serde_json::Value) {
    if let Some(obj) = payload.as_object_mut()
        && !obj.contains_key("usage")
    {
        obj.insert(
            "usage".to_string(),
            serde_json::json!({
                "prompt_tokens": 0,
                "completion_tokens": 0,
                "total_tokens": 0,
            }),
        );
    }
}

/// Current time as unix millis.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
