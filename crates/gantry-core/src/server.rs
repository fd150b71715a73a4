//! Agent-facing HTTP server.
//!
//! - `POST /mcp`: JSON-RPC from the agent (`tools/call`, `tools/list`,
//!   `ping`, `initialize`); errors come back as JSON-RPC error objects
//! - `POST /mcp/:backend`: raw passthrough to one backend
//! - `GET /health`: per-backend lifecycle states, 503 unless all are ready
//!
//! When an API key is configured every route requires it in `Authorization`,
//! either bare or as `Bearer <key>`.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;

use gantry_types::errors::GatewayError;
use gantry_types::model::{BackendState, JsonRpcError, JsonRpcMessage};

use crate::discovery::PROTOCOL_VERSION;
use crate::gateway::Gateway;

/// Response header naming the backend that produced the response.
pub const BACKEND_HEADER: &str = "x-gantry-backend";

const CODE_PARSE_ERROR: i64 = -32700;
const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// Build the axum router over a running gateway.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/mcp", post(handle_agent))
        .route("/mcp/:backend", post(handle_passthrough))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn_with_state(gateway.clone(), require_api_key))
        .with_state(gateway)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), GatewayError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "gateway listening");
    }
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Io(format!("server error: {e}")))
}

// ============================================================
// Authentication
// ============================================================

async fn require_api_key(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = gateway.api_key() else {
        return next.run(request).await;
    };
    if presented_key(request.headers()).is_some_and(|key| keys_match(key, expected)) {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "rejected request without a valid API key");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "missing or invalid API key"})),
    )
        .into_response()
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(value.strip_prefix("Bearer ").map(str::trim).unwrap_or(value))
}

/// Compare in time independent of where the keys first differ.
fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

// ============================================================
// Handlers
// ============================================================

async fn handle_agent(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let id = request.id.clone();
    let method = request.method.clone().unwrap_or_default();

    if id.is_none() {
        // Agent notifications (`notifications/initialized`, ...) end here.
        tracing::debug!(method = %method, "agent notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }

    match method.as_str() {
        "tools/call" => match gateway.router().call_tool(request).await {
            Ok(routed) => json_response(StatusCode::OK, &routed.message, Some(&routed.backend)),
            Err(e) => error_response(StatusCode::OK, id, &e),
        },
        "tools/list" => {
            let tools = gateway.router().list_tools().await;
            let message = JsonRpcMessage::response(id, json!({ "tools": tools }));
            json_response(StatusCode::OK, &message, None)
        }
        "ping" => json_response(StatusCode::OK, &JsonRpcMessage::response(id, json!({})), None),
        "initialize" => {
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "gantry", "version": env!("CARGO_PKG_VERSION") },
            });
            json_response(StatusCode::OK, &JsonRpcMessage::response(id, result), None)
        }
        other => {
            let error = JsonRpcError::new(CODE_METHOD_NOT_FOUND, format!("method not found: {other}"));
            json_response(StatusCode::OK, &JsonRpcMessage::error_response(id, error), None)
        }
    }
}

async fn handle_passthrough(
    State(gateway): State<Arc<Gateway>>,
    Path(backend): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let id = request.id.clone();

    if id.is_none() {
        return match gateway.router().forward_notification(&backend, request).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => error_response(passthrough_status(&e), None, &e),
        };
    }

    match gateway.router().forward(&backend, request).await {
        Ok(routed) => json_response(StatusCode::OK, &routed.message, Some(&routed.backend)),
        Err(e) => {
            let mut response = error_response(passthrough_status(&e), id, &e);
            if let Ok(value) = HeaderValue::from_str(&backend) {
                response.headers_mut().insert(HeaderName::from_static(BACKEND_HEADER), value);
            }
            response
        }
    }
}

async fn handle_health(State(gateway): State<Arc<Gateway>>) -> Response {
    let backends = gateway.status().await;
    let all_ready = backends.iter().all(|b| b.state == BackendState::Ready);
    let (status, label) = if all_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(json!({
            "status": label,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "backends": backends,
        })),
    )
        .into_response()
}

// ============================================================
// Helpers
// ============================================================

fn parse_request(body: &[u8]) -> Result<JsonRpcMessage, Response> {
    serde_json::from_slice::<JsonRpcMessage>(body).map_err(|e| {
        let error = JsonRpcError::new(CODE_PARSE_ERROR, format!("parse error: {e}"));
        json_response(
            StatusCode::BAD_REQUEST,
            &JsonRpcMessage::error_response(None, error),
            None,
        )
    })
}

/// HTTP status for passthrough failures; routed calls on `/mcp` always use 200.
fn passthrough_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidRequest(_) => StatusCode::NOT_FOUND,
        GatewayError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Transport { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    }
}

fn error_response(status: StatusCode, id: Option<Value>, err: &GatewayError) -> Response {
    let backend = match err {
        GatewayError::Transport { backend, .. }
        | GatewayError::Application { backend, .. }
        | GatewayError::BackendUnavailable { backend, .. }
        | GatewayError::ToolNotAllowed { backend, .. } => Some(backend.as_str()),
        _ => None,
    };
    let message = JsonRpcMessage::error_response(id, err.to_jsonrpc_error());
    json_response(status, &message, backend)
}

fn json_response(status: StatusCode, message: &JsonRpcMessage, backend: Option<&str>) -> Response {
    let mut response = (status, Json(message)).into_response();
    if let Some(value) = backend.and_then(|b| HeaderValue::from_str(b).ok()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(BACKEND_HEADER), value);
    }
    response
}
