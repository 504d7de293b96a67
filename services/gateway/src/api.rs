//! HTTP surface: chat completions, health, metrics
//!
//! The chat endpoint authenticates clients by bearer token (their pool key)
//! and hands the request body to the dispatcher untouched. Pool errors map
//! to stable JSON error shapes; upstream error statuses pass through.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use iflow_pool::{AccountHealth, BreakerStatus, Dispatcher, Error as PoolError, Registry};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tracing::info;

use crate::metrics;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<Registry>,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit layer caps simultaneous requests across all
/// clients; per-account caps are enforced by the pool itself.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let start = Instant::now();
    let bearer = bearer_token(&headers);

    let response = match state.dispatcher.dispatch(bearer, &body).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => error_response(&e),
    };

    metrics::record_request(
        response.status().as_u16(),
        "/v1/chat/completions",
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Map a pool error to a client-facing JSON error.
fn error_response(error: &PoolError) -> Response {
    let (status, kind, message, pool) = match error {
        PoolError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid or missing api key".to_string(),
            None,
        ),
        PoolError::NoRoute => (
            StatusCode::SERVICE_UNAVAILABLE,
            "no_route",
            "no account binding for this key".to_string(),
            None,
        ),
        PoolError::PoolExhausted(counts) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "pool_exhausted",
            format!("no account available ({counts})"),
            Some(*counts),
        ),
        PoolError::UpstreamFatal { status, message } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            "upstream_error",
            message.clone(),
            None,
        ),
        PoolError::RefreshFailed(_) | PoolError::Config(_) | PoolError::Io(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal error".to_string(),
            None,
        ),
    };

    let mut error_body = json!({"message": message, "type": kind});
    if let Some(counts) = pool {
        error_body["pool"] = serde_json::to_value(counts).unwrap_or(Value::Null);
    }
    (status, Json(json!({"error": error_body}))).into_response()
}

/// Configured model aliases in the OpenAI list shape.
///
/// Only aliased names are listed; any other model name passes through to
/// the upstream unchanged.
async fn models_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.registry.snapshot();
    let data: Vec<Value> = snapshot
        .models
        .keys()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "iflow"}))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

#[derive(serde::Serialize)]
struct HealthReport {
    status: &'static str,
    accounts: Vec<AccountHealth>,
}

/// Pool health rollup.
///
/// healthy: every enabled account has a closed breaker. degraded: some
/// accounts are cooling down or disabled but at least one is usable.
/// unhealthy (503): nothing can take traffic.
async fn health_handler(State(state): State<AppState>) -> Response {
    let accounts = state.registry.introspect();
    let usable = accounts
        .iter()
        .filter(|a| a.enabled && a.breaker != BreakerStatus::Open)
        .count();
    let impaired = accounts.len() - usable;

    let (code, status) = if usable == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if impaired > 0 {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    if code != StatusCode::OK {
        info!(usable, total = accounts.len(), "health check: no usable accounts");
    }

    (code, Json(HealthReport { status, accounts })).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use iflow_pool::Refresher;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;
    use upstream::{
        AccountAuth, OAuthError, OAuthProvider, RefreshedCredential, Upstream, UpstreamError,
    };

    use super::*;

    struct OkUpstream;

    impl Upstream for OkUpstream {
        fn chat_completions<'a>(
            &'a self,
            _auth: &'a AccountAuth,
            _body: &'a Value,
        ) -> Pin<Box<dyn Future<Output = Result<Value, UpstreamError>> + Send + 'a>> {
            Box::pin(async { Ok(json!({"choices": [{"message": {"content": "hi"}}]})) })
        }
    }

    struct NoOAuth;

    impl OAuthProvider for NoOAuth {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<RefreshedCredential, OAuthError>> + Send + 'a>>
        {
            Box::pin(async { Err(OAuthError::Protocol("not configured".into())) })
        }
    }

    async fn test_app(dir: &tempfile::TempDir, keys_json: &str) -> Router {
        let path = dir.path().join("keys.json");
        std::fs::write(&path, keys_json).unwrap();
        let registry = Arc::new(Registry::load(path).await.unwrap());
        let refresher = Arc::new(Refresher::new(
            Arc::clone(&registry),
            Arc::new(NoOAuth),
            std::time::Duration::from_secs(60),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(OkUpstream),
            refresher,
        ));
        let prometheus = PrometheusBuilder::new().build_recorder().handle();
        build_router(
            AppState {
                dispatcher,
                registry,
                prometheus,
            },
            16,
        )
    }

    const KEYS: &str = r#"{
        "auth": {"enabled": true, "required": true},
        "accounts": {"acc1": {"api_key": "sk-upstream"}},
        "keys": {"sk-client": {"account": "acc1"}}
    }"#;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chat_request(bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
            .body(Body::from(r#"{"model": "m", "messages": []}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn chat_routes_to_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, KEYS).await;

        let response = app.oneshot(chat_request(Some("sk-client"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn missing_bearer_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, KEYS).await;

        let response = app.oneshot(chat_request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn unknown_bearer_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, KEYS).await;

        let response = app.oneshot(chat_request(Some("sk-wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_reports_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, KEYS).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["accounts"][0]["id"], "acc1");
        // Credential must never appear unmasked
        assert_eq!(body["accounts"][0]["api_key"], "...ream");
    }

    #[tokio::test]
    async fn health_degraded_with_disabled_account() {
        let dir = tempfile::tempdir().unwrap();
        let keys = r#"{
            "accounts": {
                "acc1": {"api_key": "sk-upstream"},
                "acc2": {"api_key": "sk-off", "enabled": false}
            },
            "keys": {"sk-client": {"accounts": ["acc1", "acc2"]}}
        }"#;
        let app = test_app(&dir, keys).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn health_unhealthy_with_no_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, "{}").await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn models_lists_configured_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let keys = r#"{
            "accounts": {"acc1": {"api_key": "sk-upstream"}},
            "keys": {"sk-client": {"account": "acc1"}},
            "models": {"deepseek-chat": "deepseek-v3.2", "glm": "glm-4.6"}
        }"#;
        let app = test_app(&dir, keys).await;

        let response = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "deepseek-chat");
        assert_eq!(body["data"][1]["id"], "glm");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, KEYS).await;

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn error_shapes() {
        let response = error_response(&PoolError::UpstreamFatal {
            status: 404,
            message: "model not found".into(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = error_response(&PoolError::PoolExhausted(iflow_pool::PoolCounts {
            total: 3,
            available: 0,
            cooling_down: 2,
            disabled: 1,
        }));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Out-of-range upstream status falls back to 502
        let response = error_response(&PoolError::UpstreamFatal {
            status: 42,
            message: "weird".into(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk-abc"));

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
