/// Shared data types used across all gantry subsystems.
///
/// JSON-RPC 2.0 message shapes spoken on every transport, backend lifecycle
/// states, and the transport kinds a backend can be reached through.
use serde::{Deserialize, Serialize};

// ============================================================
// JSON-RPC Types
// ============================================================

/// JSON-RPC protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 message for MCP communication.
///
/// One shape covers requests, notifications and responses; absent members are
/// omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (None for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Method name (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Result (for responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error (for error responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Build a request with a numeric id.
    pub fn request(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(serde_json::Value::from(id)),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a notification (a request without an id).
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a successful response.
    pub fn response(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error_response(id: Option<serde_json::Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// True when the message carries a non-null `error` member.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True for responses: no method, and an id.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// Key used to correlate a response with its request.
    ///
    /// Numeric and string ids are both supported; `1` and `"1"` map to the
    /// same key, which is harmless because the gateway only issues numbers.
    pub fn id_key(&self) -> Option<String> {
        match self.id.as_ref()? {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDef {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

// ============================================================
// Backend Types
// ============================================================

/// Lifecycle state of one backend.
///
/// `Unstarted -> Starting -> Ready | Failed`, and `Stopped` after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Unstarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl BackendState {
    /// Backends in these states own a live process or connection that must be stopped.
    pub fn needs_stop(self) -> bool {
        matches!(self, BackendState::Starting | BackendState::Ready)
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendState::Unstarted => "unstarted",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Failed => "failed",
            BackendState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The mechanism a backend is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local child process speaking newline-delimited JSON-RPC over stdin/stdout.
    #[serde(alias = "local")]
    Stdio,
    /// Container-isolated child process with the same framing as stdio.
    #[serde(alias = "docker")]
    Container,
    /// Remote endpoint accepting JSON-RPC POST bodies.
    #[serde(alias = "remote")]
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Container => "container",
            TransportKind::Http => "http",
        };
        f.write_str(s)
    }
}
