//! HTTP API server for pairing requests.
//!
//! Provides the pairing and status endpoints, bearer-protected admin
//! endpoints, and the WebSocket transport in [`stream`].

mod stream;

use crate::gateway::{Gateway, PairingStarted};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use prime_core::config::ServerConfig;
use prime_core::error::PairingError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

type ApiError = (StatusCode, Json<Value>);

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    gateway: Gateway,
    api_key: Option<String>,
    uptime: Instant,
}

/// Body of `POST /pairing-request`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingRequest {
    #[serde(default)]
    phone_number: Option<String>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)` if rejected.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Option<ApiError> {
    let key = api_key.as_ref()?;

    let header = match headers.get("authorization") {
        Some(h) => h,
        None => {
            return Some(error_body(
                StatusCode::UNAUTHORIZED,
                "missing Authorization header",
            ));
        }
    };

    let value = match header.to_str() {
        Ok(v) => v,
        Err(_) => {
            return Some(error_body(
                StatusCode::UNAUTHORIZED,
                "invalid Authorization header",
            ));
        }
    };

    match value.strip_prefix("Bearer ") {
        Some(token) if token == key => None,
        _ => Some(error_body(StatusCode::UNAUTHORIZED, "invalid token")),
    }
}

/// HTTP status for a failed pairing start.
fn pairing_error_status(err: &PairingError) -> StatusCode {
    match err {
        PairingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PairingError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Parse a pairing request body and start the session.
async fn start_from_body(state: &ApiState, body: &Bytes) -> Result<PairingStarted, ApiError> {
    let request: PairingRequest = if body.is_empty() {
        PairingRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?
    };

    let phone_number = request
        .phone_number
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| error_body(StatusCode::BAD_REQUEST, "phoneNumber is required"))?;

    // HTTP callers only see the final result; progress events go nowhere.
    state
        .gateway
        .start_pairing(&phone_number, crate::gateway::EventSink::discard(), None)
        .await
        .map_err(|e| {
            let status = pairing_error_status(&e);
            if status != StatusCode::BAD_REQUEST {
                warn!("api: pairing request failed: {e}");
            }
            error_body(status, e.to_string())
        })
}

/// `POST /pairing-request` — start a session and answer with its pairing code.
async fn pairing_request(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PairingStarted>), ApiError> {
    let started = start_from_body(&state, &body).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// `POST /api/generate-session` — same as `/pairing-request`, with the
/// `success` flag web clients check.
async fn generate_session(
    State(state): State<ApiState>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    match start_from_body(&state, &body).await {
        Ok(started) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "sessionId": started.session_id,
                "pairingCode": started.pairing_code,
            })),
        ),
        Err((status, Json(mut payload))) => {
            payload["success"] = Value::Bool(false);
            (status, Json(payload))
        }
    }
}

/// `GET /session-status/{session_id}`
async fn session_status(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    Json(json!({"status": state.gateway.session_status(&session_id)}))
}

/// `GET /api/health` — Health check with uptime and live session count.
async fn health(headers: HeaderMap, State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "active_sessions": state.gateway.active_sessions(),
    })))
}

/// `GET /api/sessions` — every tracked session, phone numbers masked.
async fn sessions(
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    Ok(Json(json!({"sessions": state.gateway.summaries()})))
}

/// CORS for browser clients. `"*"` allows any origin; otherwise only the
/// listed ones. No origins means no CORS headers at all.
fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let mut parsed = Vec::new();
        for origin in origins {
            match HeaderValue::from_str(origin) {
                Ok(value) => parsed.push(value),
                Err(e) => warn!("api: ignoring invalid CORS origin '{origin}': {e}"),
            }
        }
        AllowOrigin::list(parsed)
    };

    Some(
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_origin(allow_origin),
    )
}

/// Build the axum router with shared state.
fn build_router(state: ApiState, cors_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/pairing-request", post(pairing_request))
        .route("/api/generate-session", post(generate_session))
        .route("/session-status/{session_id}", get(session_status))
        .route("/api/session-status/{session_id}", get(session_status))
        .route("/api/health", get(health))
        .route("/api/sessions", get(sessions))
        .route("/ws", get(stream::upgrade))
        .with_state(state);

    match build_cors_layer(cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Start the API server and run it until `shutdown` resolves.
pub async fn serve(
    config: ServerConfig,
    gateway: Gateway,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let api_key = if config.api_key.is_empty() {
        None
    } else {
        Some(config.api_key.clone())
    };

    let state = ApiState {
        gateway,
        api_key,
        uptime: Instant::now(),
    };

    let app = build_router(state, &config.cors_origins);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("API server failed to bind to {addr}: {e}"))?;

    info!("API server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("API server error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::Harness;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(h: &Harness, api_key: Option<String>) -> Router {
        let state = ApiState {
            gateway: h.gateway.clone(),
            api_key,
            uptime: Instant::now(),
        };
        build_router(state, &[])
    }

    fn cors_router(h: &Harness, origins: &[&str]) -> Router {
        let state = ApiState {
            gateway: h.gateway.clone(),
            api_key: None,
            uptime: Instant::now(),
        };
        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        build_router(state, &origins)
    }

    fn preflight(uri: &str, origin: &str) -> Request<Body> {
        Request::options(uri)
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_pairing_request_returns_code() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let json = body_json(resp).await;
        assert_eq!(json["pairingCode"], "ABCD-1234-EFGH");
        let session_id = json["sessionId"].as_str().unwrap();
        assert_eq!(h.gateway.session_status(session_id), "waiting");

        h.gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_generate_session_alias() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/api/generate-session",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["pairingCode"], "ABCD-1234-EFGH");
        assert!(json["sessionId"].as_str().unwrap().starts_with("session_"));

        h.gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_generate_session_failure_flag() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json("/api/generate-session", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("phoneNumber"));
    }

    #[tokio::test]
    async fn test_registered_device_answers_without_code() {
        let h = Harness::new();
        *h.factory.restored.lock().unwrap() = Some(serde_json::json!({"registered": true}));
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let json = body_json(resp).await;
        assert!(json["pairingCode"].is_null());
        let session_id = json["sessionId"].as_str().unwrap();
        assert_eq!(h.gateway.session_status(session_id), "waiting");
        assert_eq!(h.factory.client.code_requests.load(Ordering::SeqCst), 0);

        h.gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_cors_any_origin() {
        let h = Harness::new();
        let app = cors_router(&h, &["*"]);

        let resp = app
            .oneshot(preflight("/api/generate-session", "https://pair.example"))
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn test_cors_listed_origins_only() {
        let h = Harness::new();
        let app = cors_router(&h, &["https://pair.example"]);

        let resp = app
            .clone()
            .oneshot(preflight("/pairing-request", "https://pair.example"))
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("https://pair.example")
        );

        let resp = app
            .oneshot(preflight("/pairing-request", "https://elsewhere.example"))
            .await
            .unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_no_cors_headers_without_origins() {
        let h = Harness::new();
        let app = test_router(&h, None);
        let req = Request::get("/api/health")
            .header("origin", "https://pair.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_pairing_request_missing_phone() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json("/pairing-request", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("phoneNumber"));
        assert_eq!(h.gateway.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_pairing_request_invalid_phone() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"+1 (555) 123"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("invalid phone number"));
    }

    #[tokio::test]
    async fn test_pairing_request_malformed_json() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json("/pairing-request", "{phone"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pairing_request_code_failure_is_500() {
        let h = Harness::new();
        *h.factory.client.code.lock().unwrap() = Err("rate-overlimit".to_string());
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("rate-overlimit"));
    }

    #[tokio::test]
    async fn test_pairing_request_timeout_is_504() {
        let h = Harness::with(|s| s.code_timeout = Duration::from_millis(50));
        *h.factory.client.code_delay.lock().unwrap() = Duration::from_secs(2);
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_pairing_request_client_start_failure() {
        let h = Harness::new();
        h.factory.fail.store(true, Ordering::SeqCst);
        let app = test_router(&h, None);

        let resp = app
            .oneshot(post_json(
                "/pairing-request",
                r#"{"phoneNumber":"15551234567"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_session_status_unknown() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let req = Request::get("/session-status/session_0_nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "not_found");
    }

    #[tokio::test]
    async fn test_session_status_alias() {
        let h = Harness::new();
        let app = test_router(&h, None);

        let req = Request::get("/api/session-status/session_0_nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(body_json(resp).await["status"], "not_found");
    }

    #[tokio::test]
    async fn test_health_no_auth() {
        let h = Harness::new();
        let app = test_router(&h, None);
        let req = Request::get("/api/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_health_valid_auth() {
        let h = Harness::new();
        let app = test_router(&h, Some("secret".to_string()));
        let req = Request::get("/api/health")
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_bad_auth() {
        let h = Harness::new();
        let app = test_router(&h, Some("secret".to_string()));
        let req = Request::get("/api/health")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sessions_missing_auth() {
        let h = Harness::new();
        let app = test_router(&h, Some("secret".to_string()));
        let req = Request::get("/api/sessions").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sessions_lists_live_sessions() {
        let h = Harness::new();
        h.gateway
            .start_pairing(
                "15551234567",
                crate::gateway::EventSink::discard(),
                None,
            )
            .await
            .unwrap();
        let app = test_router(&h, None);

        let req = Request::get("/api/sessions").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let sessions = json["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["phone"], "*******4567");
        assert_eq!(sessions[0]["state"], "code_requested");

        h.gateway.shutdown().await;
    }

    #[test]
    fn test_pairing_error_status_mapping() {
        assert_eq!(
            pairing_error_status(&PairingError::InvalidInput("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            pairing_error_status(&PairingError::TimedOut),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            pairing_error_status(&PairingError::Export("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
