//! MCP HTTP transport implementation.
//!
//! Client for remote MCP servers using the streamable HTTP transport:
//! - HTTP POST of one JSON-RPC request per call
//! - Response as `application/json` or a `text/event-stream` body
//! - Session management via the `Mcp-Session-Id` header
//! - Per-backend credentials merged into every request's headers
//!
//! Failures are classified into [`TransportFailure`] so the router and the
//! health checker see the same taxonomy as for the framed transports.

use std::time::Duration;

use tokio::sync::Mutex;

use gantry_security::CredentialSet;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::JsonRpcMessage;

// ============================================================
// Configuration
// ============================================================

/// Configuration for the HTTP MCP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Endpoint URL the JSON-RPC bodies are POSTed to.
    pub url: String,
    /// Resolved headers for this backend only.
    pub credentials: CredentialSet,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(url: impl Into<String>, credentials: CredentialSet) -> Self {
        Self {
            url: url.into(),
            credentials,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================
// SSE Event Parser
// ============================================================

/// A parsed SSE event from a `text/event-stream` response.
#[derive(Debug, Clone, Default)]
struct SseEvent {
    /// The `id:` field.
    id: Option<String>,
    /// The `event:` field (event type).
    event: Option<String>,
    /// The `data:` field (accumulated across multiple `data:` lines).
    data: String,
}

/// Parse a raw SSE body into individual events.
///
/// SSE events are separated by blank lines. Each event can contain
/// `id:`, `event:`, `data:`, and `retry:` fields.
fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let normalized = body.replace("\r\n", "\n");
    let mut events = Vec::new();
    for raw_event in normalized.split("\n\n") {
        let trimmed = raw_event.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut event = SseEvent::default();
        let mut has_data = false;

        for line in trimmed.lines() {
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "id" => event.id = Some(value.to_string()),
                "event" => event.event = Some(value.to_string()),
                "data" => {
                    if has_data {
                        event.data.push('\n');
                    }
                    event.data.push_str(value);
                    has_data = true;
                }
                // `retry` and unknown fields are ignored.
                _ => {}
            }
        }

        if has_data {
            events.push(event);
        }
    }
    events
}

/// Pick the JSON-RPC response for `request_id` out of an event stream body.
///
/// Only `message` events (or untyped events) are considered. A stream with
/// no response for `request_id` is a protocol error; without a request id the
/// first response is taken.
fn select_sse_response(
    body: &str,
    request_id: Option<&str>,
) -> Result<JsonRpcMessage, TransportFailure> {
    let mut responses = Vec::new();
    for event in parse_sse_events(body) {
        let is_message = event.event.as_deref().is_none_or(|e| e == "message");
        if !is_message || event.data.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(&event.data) {
            Ok(msg) if msg.is_response() => responses.push(msg),
            Ok(msg) => {
                tracing::debug!(method = ?msg.method, "ignoring server-initiated SSE message");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse SSE event data as JSON-RPC message");
            }
        }
    }

    if responses.is_empty() {
        return Err(TransportFailure::Protocol(
            "event stream carried no JSON-RPC response".to_string(),
        ));
    }
    let Some(request_id) = request_id else {
        return Ok(responses.swap_remove(0));
    };
    let position = responses
        .iter()
        .position(|msg| msg.id_key().as_deref() == Some(request_id))
        .ok_or_else(|| {
            TransportFailure::Protocol(format!(
                "event stream carried no response for request id {request_id}"
            ))
        })?;
    Ok(responses.swap_remove(position))
}

// ============================================================
// Failure Classification
// ============================================================

/// Map a reqwest error onto the shared failure taxonomy.
pub fn classify_request_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::Timeout
    } else if err.is_connect() {
        if error_chain_mentions_dns(err) {
            TransportFailure::DnsFailure
        } else {
            TransportFailure::ConnectionRefused
        }
    } else if err.is_decode() || err.is_body() {
        TransportFailure::Protocol(err.to_string())
    } else {
        TransportFailure::Io(err.to_string())
    }
}

/// Resolver failures surface as connect errors; only the source chain tells them apart.
fn error_chain_mentions_dns(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("no such host")
        {
            return true;
        }
        current = e.source();
    }
    false
}

// ============================================================
// Transport State
// ============================================================

struct SessionState {
    /// The `Mcp-Session-Id` header value returned by the server.
    session_id: Option<String>,
    connected: bool,
}

// ============================================================
// HttpTransport
// ============================================================

/// HTTP transport for remote MCP servers.
///
/// Concurrent `send()` calls are independent requests on reqwest's
/// connection pool; only the session id is shared between them.
pub struct HttpTransport {
    backend: String,
    config: HttpTransportConfig,
    client: reqwest::Client,
    base_headers: reqwest::header::HeaderMap,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("backend", &self.backend)
            .field("url", &self.config.url)
            .field("headers", &self.config.credentials.header_names())
            .finish()
    }
}

impl HttpTransport {
    /// Create a new HTTP transport for `backend`.
    ///
    /// Builds a `reqwest::Client` with the configured connect timeout, and the
    /// header set every request carries.
    pub fn new(backend: impl Into<String>, config: HttpTransportConfig) -> Result<Self, GatewayError> {
        let backend = backend.into();
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build().map_err(|e| GatewayError::Startup {
            backend: backend.clone(),
            reason: format!("failed to build HTTP client: {e}"),
        })?;

        let mut base_headers = reqwest::header::HeaderMap::new();
        base_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        base_headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        config.credentials.apply_headers(&mut base_headers);

        Ok(Self {
            backend,
            config,
            client,
            base_headers,
            state: Mutex::new(SessionState {
                session_id: None,
                connected: false,
            }),
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Validate the endpoint and open the transport for requests.
    ///
    /// No network traffic happens here; reachability is the health checker's job.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let url = reqwest::Url::parse(&self.config.url).map_err(|e| GatewayError::Startup {
            backend: self.backend.clone(),
            reason: format!("invalid url '{}': {e}", self.config.url),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::Startup {
                backend: self.backend.clone(),
                reason: format!("unsupported url scheme '{}'", url.scheme()),
            });
        }

        let mut state = self.state.lock().await;
        state.connected = true;
        tracing::info!(backend = %self.backend, url = %self.config.url, "HTTP transport ready");
        Ok(())
    }

    /// Close the transport. Later sends fail with [`TransportFailure::Closed`].
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.session_id = None;
        tracing::info!(backend = %self.backend, "HTTP transport closed");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// POST one JSON-RPC request and wait at most `timeout` for its response.
    ///
    /// A response carrying a JSON-RPC `error` is returned as `Ok`; only
    /// failures to obtain a parsed response are errors.
    pub async fn send(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let session_id = {
            let state = self.state.lock().await;
            if !state.connected {
                return Err(self.failure(TransportFailure::Closed));
            }
            state.session_id.clone()
        };

        tracing::debug!(
            backend = %self.backend,
            method = ?request.method,
            id = ?request.id,
            "sending JSON-RPC request via HTTP POST"
        );

        match tokio::time::timeout(timeout, self.post(&request, session_id)).await {
            Ok(result) => result.map_err(|failure| self.failure(failure)),
            Err(_) => Err(self.failure(TransportFailure::Timeout)),
        }
    }

    /// POST a notification. Any 2xx status (typically 202 with no body) is success.
    pub async fn notify(&self, message: JsonRpcMessage, timeout: Duration) -> Result<(), GatewayError> {
        let session_id = {
            let state = self.state.lock().await;
            if !state.connected {
                return Err(self.failure(TransportFailure::Closed));
            }
            state.session_id.clone()
        };
        let body = serde_json::to_vec(&message)?;
        let exchange = async {
            let response = self
                .client
                .post(&self.config.url)
                .headers(self.request_headers(session_id))
                .body(body)
                .send()
                .await
                .map_err(|e| classify_request_error(&e))?;
            self.capture_session_id(response.headers()).await;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(TransportFailure::Http {
                    status: response.status().as_u16(),
                })
            }
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result.map_err(|failure| self.failure(failure)),
            Err(_) => Err(self.failure(TransportFailure::Timeout)),
        }
    }

    fn request_headers(&self, session_id: Option<String>) -> reqwest::header::HeaderMap {
        let mut headers = self.base_headers.clone();
        if let Some(session_id) = session_id {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&session_id) {
                headers.insert(
                    reqwest::header::HeaderName::from_static("mcp-session-id"),
                    value,
                );
            }
        }
        headers
    }

    async fn post(
        &self,
        request: &JsonRpcMessage,
        session_id: Option<String>,
    ) -> Result<JsonRpcMessage, TransportFailure> {
        let body =
            serde_json::to_vec(request).map_err(|e| TransportFailure::Protocol(e.to_string()))?;

        let response = self
            .client
            .post(&self.config.url)
            .headers(self.request_headers(session_id))
            .body(body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        self.capture_session_id(response.headers()).await;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(backend = %self.backend, %status, "backend returned HTTP error");
            return Err(TransportFailure::Http {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let text = response
            .text()
            .await
            .map_err(|e| classify_request_error(&e))?;

        if text.trim().is_empty() {
            return Err(TransportFailure::Protocol("empty response body".to_string()));
        }

        if content_type.contains("text/event-stream") {
            select_sse_response(&text, request.id_key().as_deref())
        } else {
            serde_json::from_str::<JsonRpcMessage>(&text)
                .map_err(|e| TransportFailure::Protocol(format!("invalid JSON-RPC body: {e}")))
        }
    }

    /// Extract and store the session ID from response headers.
    async fn capture_session_id(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
            let mut state = self.state.lock().await;
            if state.session_id.as_deref() != Some(value) {
                tracing::debug!(backend = %self.backend, session_id = value, "captured MCP session ID");
                state.session_id = Some(value.to_string());
            }
        }
    }

    fn failure(&self, failure: TransportFailure) -> GatewayError {
        GatewayError::transport(&self.backend, failure)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::post;
    use axum::Router;
    use gantry_security::SecretBroker;
    use gantry_types::config::BackendSpec;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Start a test server and return its endpoint URL.
    async fn start_test_server(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    async fn started(url: &str) -> HttpTransport {
        let transport =
            HttpTransport::new("remote", HttpTransportConfig::new(url, CredentialSet::empty("remote")))
                .unwrap();
        transport.start().await.unwrap();
        transport
    }

    fn json_response(body: impl Into<String>) -> Response {
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn sse_response(body: &'static str) -> Response {
        Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(Body::from(body))
            .unwrap()
    }

    fn failure_of(err: GatewayError) -> TransportFailure {
        match err {
            GatewayError::Transport { backend, failure } => {
                assert_eq!(backend, "remote");
                failure
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    // ----------------------------------------------------------
    // Test: SSE event parsing
    // ----------------------------------------------------------

    #[test]
    fn test_parse_single_sse_event() {
        let raw = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"ok\"}\n\n";
        let events = parse_sse_events(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"ok\"}");
        assert!(events[0].id.is_none());
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_parse_sse_multiline_data_and_crlf() {
        let raw = "id: e1\r\ndata: line1\r\ndata: line2\r\n\r\n";
        let events = parse_sse_events(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("e1"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_parse_sse_comments_and_dataless_events_skipped() {
        let raw = ": keepalive\n\nid: 123\nevent: ping\n\ndata: {}\n\n";
        let events = parse_sse_events(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_select_sse_response_matches_request_id() {
        let raw = "\
event: message\n\
data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
\n\
data: {\"jsonrpc\":\"2.0\",\"id\":6,\"result\":\"other\"}\n\
\n\
data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":\"mine\"}\n\
\n";
        let msg = select_sse_response(raw, Some("7")).unwrap();
        assert_eq!(msg.result, Some(json!("mine")));
    }

    #[test]
    fn test_select_sse_response_with_other_ids_is_protocol_error() {
        let raw = "\
data: {\"jsonrpc\":\"2.0\",\"id\":6,\"result\":\"other\"}\n\
\n";
        let failure = select_sse_response(raw, Some("7")).unwrap_err();
        match failure {
            TransportFailure::Protocol(msg) => assert!(msg.contains("request id 7"), "{msg}"),
            other => panic!("expected a protocol failure, got {other:?}"),
        }
    }

    #[test]
    fn test_select_sse_response_without_response_is_protocol_error() {
        let raw = "event: endpoint\ndata: /messages\n\n";
        let failure = select_sse_response(raw, Some("1")).unwrap_err();
        assert!(matches!(failure, TransportFailure::Protocol(_)));
    }

    // ----------------------------------------------------------
    // Test: request/response round trips
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_send_json_response() {
        let app = Router::new().route(
            "/mcp",
            post(|| async { json_response(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#) }),
        );
        let transport = started(&start_test_server(app).await).await;

        let response = transport
            .send(JsonRpcMessage::request(1, "tools/list", None), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.result, Some(json!({"tools": []})));
    }

    #[tokio::test]
    async fn test_send_sse_response() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                sse_response("id: evt-1\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n\n")
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let response = transport
            .send(JsonRpcMessage::request(3, "ping", None), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(3)));
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_sse_response_for_another_request_is_rejected() {
        let app = Router::new().route(
            "/mcp",
            post(|| async { sse_response("data: {\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{}}\n\n") }),
        );
        let transport = started(&start_test_server(app).await).await;

        let err = transport
            .send(JsonRpcMessage::request(3, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(failure_of(err), TransportFailure::Protocol(_)));
    }

    #[tokio::test]
    async fn test_application_error_is_not_transport_failure() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                json_response(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"bad repo"}}"#)
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let response = transport
            .send(JsonRpcMessage::request(1, "tools/call", None), TIMEOUT)
            .await
            .unwrap();
        assert!(response.is_error());
        assert_eq!(response.error.unwrap().message, "bad repo");
    }

    #[tokio::test]
    async fn test_request_body_is_valid_json_rpc() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": parsed["id"],
                    "result": {"method": parsed["method"], "version": parsed["jsonrpc"]},
                });
                json_response(body.to_string())
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let response = transport
            .send(JsonRpcMessage::request(42, "ping", None), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(42)));
        assert_eq!(response.result, Some(json!({"method": "ping", "version": "2.0"})));
    }

    // ----------------------------------------------------------
    // Test: headers
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_session_id_tracking() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let app = Router::new().route(
            "/mcp",
            post(move |req: Request| {
                let count = call_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    let seen = req
                        .headers()
                        .get("mcp-session-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .header("mcp-session-id", "session-abc-123")
                        .body(Body::from(
                            json!({"jsonrpc": "2.0", "id": count + 1, "result": seen}).to_string(),
                        ))
                        .unwrap()
                }
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let first = transport
            .send(JsonRpcMessage::request(1, "initialize", None), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(first.result, Some(json!("none")));

        let second = transport
            .send(JsonRpcMessage::request(2, "tools/list", None), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(second.result, Some(json!("session-abc-123")));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_credential_headers_included() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                let accept = req
                    .headers()
                    .get("accept")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                json_response(
                    json!({"jsonrpc": "2.0", "id": 1, "result": {"auth": auth, "accept": accept}})
                        .to_string(),
                )
            }),
        );
        let url = start_test_server(app).await;

        let broker = SecretBroker::with_lookup(Arc::new(|name: &str| {
            (name == "GITHUB_TOKEN").then(|| "test-token-xyz".to_string())
        }))
        .unwrap();
        let spec = BackendSpec {
            url: Some(url.clone()),
            headers: [("Authorization".to_string(), "Bearer ${GITHUB_TOKEN}".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let credentials = broker.resolve("remote", &spec).unwrap();
        let transport =
            HttpTransport::new("remote", HttpTransportConfig::new(url, credentials)).unwrap();
        transport.start().await.unwrap();

        let response = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["auth"], "Bearer test-token-xyz");
        assert!(result["accept"].as_str().unwrap().contains("text/event-stream"));
        assert!(!format!("{transport:?}").contains("test-token-xyz"));
    }

    #[tokio::test]
    async fn test_notification_accepts_empty_202() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body(Body::empty())
                    .unwrap()
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        transport
            .notify(
                JsonRpcMessage::notification("notifications/initialized", None),
                TIMEOUT,
            )
            .await
            .unwrap();
    }

    // ----------------------------------------------------------
    // Test: failure classification
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_http_status_failures() {
        let app = Router::new()
            .route(
                "/mcp",
                post(|| async {
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::from("internal server error"))
                        .unwrap()
                }),
            )
            .route(
                "/missing",
                post(|| async {
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Body::from("not found"))
                        .unwrap()
                }),
            );
        let url = start_test_server(app).await;

        let transport = started(&url).await;
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(failure_of(err), TransportFailure::Http { status: 500 });

        let transport = started(&url.replace("/mcp", "/missing")).await;
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_of(err), TransportFailure::Http { status: 404 });
    }

    #[tokio::test]
    async fn test_unparsable_body_is_protocol_error() {
        let app = Router::new().route("/mcp", post(|| async { json_response("<html>oops</html>") }));
        let transport = started(&start_test_server(app).await).await;

        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(failure_of(err), TransportFailure::Protocol(_)));
    }

    #[tokio::test]
    async fn test_empty_body_is_protocol_error() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::empty())
                    .unwrap()
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(failure_of(err), TransportFailure::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = started(&format!("http://{addr}/mcp")).await;
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_of(err), TransportFailure::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dns_failure() {
        let transport = started("http://gantry-test.invalid/mcp").await;
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_of(err), TransportFailure::DnsFailure);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                json_response(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            }),
        );
        let transport = started(&start_test_server(app).await).await;

        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), Duration::from_millis(100))
            .await
            .unwrap_err();
        let failure = failure_of(err);
        assert_eq!(failure, TransportFailure::Timeout);
        assert_eq!(failure.to_string(), "Connection timeout");
    }

    // ----------------------------------------------------------
    // Test: lifecycle
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_send_before_start_and_after_stop_is_closed() {
        let transport = HttpTransport::new(
            "remote",
            HttpTransportConfig::new("http://localhost:9", CredentialSet::empty("remote")),
        )
        .unwrap();
        assert!(!transport.is_connected().await);
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_of(err), TransportFailure::Closed);

        transport.start().await.unwrap();
        assert!(transport.is_connected().await);
        transport.stop().await.unwrap();
        assert!(!transport.is_connected().await);
        let err = transport
            .send(JsonRpcMessage::request(1, "ping", None), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_of(err), TransportFailure::Closed);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_url() {
        for url in ["not a url", "ftp://example.com/mcp"] {
            let transport =
                HttpTransport::new("remote", HttpTransportConfig::new(url, CredentialSet::empty("remote")))
                    .unwrap();
            let err = transport.start().await.unwrap_err();
            assert!(matches!(err, GatewayError::Startup { .. }), "{url}: {err}");
        }
    }
}
