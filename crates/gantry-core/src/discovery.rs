//! MCP session handshake and tool discovery against one backend.

use std::time::Duration;

use serde_json::{json, Value};

use gantry_tools::BackendInstance;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::{JsonRpcMessage, McpToolDef};

/// MCP protocol revision the gateway speaks to backends.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Stop following `nextCursor` after this many pages.
const MAX_PAGES: usize = 100;

/// Run `initialize` + `notifications/initialized` unless already done.
///
/// Returns the server's `serverInfo`, if this call performed the handshake.
pub async fn ensure_initialized(
    backend: &BackendInstance,
    timeout: Duration,
) -> Result<Option<Value>, GatewayError> {
    if backend.is_initialized() {
        return Ok(None);
    }

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "gantry",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = backend
        .call(JsonRpcMessage::request(0, "initialize", Some(params)), timeout)
        .await?;
    let result = expect_result(backend, response)?;

    backend
        .notify(
            JsonRpcMessage::notification("notifications/initialized", None),
            timeout,
        )
        .await?;
    backend.mark_initialized();

    let server_info = result.get("serverInfo").cloned();
    tracing::info!(
        backend = %backend.name(),
        server = ?server_info,
        protocol = ?result.get("protocolVersion"),
        "MCP session initialized"
    );
    Ok(server_info)
}

/// Fetch every tool the backend advertises, following pagination.
pub async fn list_tools(
    backend: &BackendInstance,
    timeout: Duration,
) -> Result<Vec<McpToolDef>, GatewayError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let response = backend
            .call(JsonRpcMessage::request(0, "tools/list", params), timeout)
            .await?;
        let result = expect_result(backend, response)?;

        let page = result
            .get("tools")
            .cloned()
            .ok_or_else(|| protocol(backend, "tools/list result has no 'tools' array"))?;
        let page: Vec<McpToolDef> = serde_json::from_value(page)
            .map_err(|e| protocol(backend, &format!("malformed tools/list result: {e}")))?;
        tools.extend(page);

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);
        if cursor.is_none() {
            return Ok(tools);
        }
    }

    tracing::warn!(
        backend = %backend.name(),
        pages = MAX_PAGES,
        "tools/list pagination did not terminate; using the tools collected so far"
    );
    Ok(tools)
}

fn expect_result(backend: &BackendInstance, response: JsonRpcMessage) -> Result<Value, GatewayError> {
    if let Some(error) = response.error {
        return Err(GatewayError::Application {
            backend: backend.name().to_string(),
            error,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn protocol(backend: &BackendInstance, message: &str) -> GatewayError {
    GatewayError::transport(backend.name(), TransportFailure::Protocol(message.to_string()))
}
