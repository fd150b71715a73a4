use crate::model::{BackendState, JsonRpcError};

/// JSON-RPC code returned to the agent when no backend serves the tool.
pub const CODE_TOOL_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for malformed agent requests.
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC code for gateway-internal failures.
pub const CODE_INTERNAL: i64 = -32603;
/// JSON-RPC code for transport failures reaching a backend.
pub const CODE_TRANSPORT: i64 = -32000;
/// JSON-RPC code when the owning backend is not ready.
pub const CODE_BACKEND_UNAVAILABLE: i64 = -32003;
/// JSON-RPC code when the backend's allow filter rejects the tool.
pub const CODE_TOOL_NOT_ALLOWED: i64 = -32004;

/// Unified error type for the gantry gateway.
///
/// All crates use this error type for propagation across crate boundaries.
/// Variants follow the gateway's failure taxonomy: configuration and startup
/// errors, transport and application failures from a backend, and the
/// deterministic routing errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid or ambiguous configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// A backend's adapter failed to spawn or connect.
    #[error("backend '{backend}' failed to start: {reason}")]
    Startup { backend: String, reason: String },

    /// The request never produced a parsed response.
    #[error("transport error from backend '{backend}': {failure}")]
    Transport {
        backend: String,
        failure: TransportFailure,
    },

    /// The backend answered with a JSON-RPC `error` object.
    #[error("backend '{backend}' returned error {}: {}", .error.code, .error.message)]
    Application { backend: String, error: JsonRpcError },

    /// No backend claims the tool.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The owning backend is not in the `ready` state.
    #[error("backend '{backend}' is unavailable (state: {state})")]
    BackendUnavailable { backend: String, state: BackendState },

    /// The owning backend's allow filter excludes the tool.
    #[error("tool '{tool}' is not allowed on backend '{backend}'")]
    ToolNotAllowed { tool: String, backend: String },

    /// The agent's request is malformed (missing tool name, bad params).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local I/O error (config files, process pipes before a backend exists).
    #[error("io error: {0}")]
    Io(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a transport failure on a named backend.
    pub fn transport(backend: impl Into<String>, failure: TransportFailure) -> Self {
        GatewayError::Transport {
            backend: backend.into(),
            failure,
        }
    }

    /// Only transport failures may be retried; everything else is deterministic
    /// or reflects backend tool logic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }

    /// The transport failure carried by this error, if any.
    pub fn transport_failure(&self) -> Option<&TransportFailure> {
        match self {
            GatewayError::Transport { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Convert into the JSON-RPC error object returned to the agent.
    ///
    /// Application errors pass through verbatim.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            GatewayError::Application { error, .. } => error.clone(),
            GatewayError::ToolNotFound(tool) => {
                JsonRpcError::new(CODE_TOOL_NOT_FOUND, self.to_string())
                    .with_data(serde_json::json!({ "kind": "tool-not-found", "tool": tool }))
            }
            GatewayError::BackendUnavailable { backend, state } => {
                JsonRpcError::new(CODE_BACKEND_UNAVAILABLE, self.to_string()).with_data(
                    serde_json::json!({
                        "kind": "backend-unavailable",
                        "backend": backend,
                        "state": state,
                    }),
                )
            }
            GatewayError::ToolNotAllowed { tool, backend } => {
                JsonRpcError::new(CODE_TOOL_NOT_ALLOWED, self.to_string()).with_data(
                    serde_json::json!({
                        "kind": "tool-not-allowed",
                        "tool": tool,
                        "backend": backend,
                    }),
                )
            }
            GatewayError::Transport { backend, failure } => {
                let mut data = failure.to_data();
                data["backend"] = serde_json::Value::from(backend.as_str());
                JsonRpcError::new(CODE_TRANSPORT, self.to_string()).with_data(data)
            }
            GatewayError::InvalidRequest(_) | GatewayError::Serialization(_) => {
                JsonRpcError::new(CODE_INVALID_PARAMS, self.to_string())
            }
            _ => JsonRpcError::new(CODE_INTERNAL, self.to_string()),
        }
    }
}

/// Classified transport-level failure, shared by all three transports so the
/// router and health checker can treat them uniformly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection timeout")]
    Timeout,

    #[error("DNS resolution failed")]
    DnsFailure,

    /// The backend process exited before answering.
    #[error("Backend crashed")]
    BackendCrashed,

    /// The backend answered with something that is not a JSON-RPC response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error {status}")]
    Http { status: u16 },

    /// The adapter is not started or was stopped.
    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportFailure {
    /// Stable kebab-case identifier used in logs and error data.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportFailure::ConnectionRefused => "connection-refused",
            TransportFailure::Timeout => "timeout",
            TransportFailure::DnsFailure => "dns-failure",
            TransportFailure::BackendCrashed => "backend-crashed",
            TransportFailure::Protocol(_) => "protocol-error",
            TransportFailure::Http { .. } => "http-error",
            TransportFailure::Closed => "closed",
            TransportFailure::Io(_) => "io-error",
        }
    }
}

impl TransportFailure {
    /// Structured form carried in a JSON-RPC error's `data`.
    pub fn to_data(&self) -> serde_json::Value {
        let mut data = serde_json::json!({ "kind": self.kind() });
        match self {
            TransportFailure::Http { status } => data["status"] = serde_json::Value::from(*status),
            TransportFailure::Protocol(detail) | TransportFailure::Io(detail) => {
                data["detail"] = serde_json::Value::from(detail.as_str())
            }
            _ => {}
        }
        data
    }

    /// Inverse of [`to_data`](Self::to_data), for failures relayed by another gateway.
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        let detail = || {
            data.get("detail")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let failure = match data.get("kind")?.as_str()? {
            "connection-refused" => TransportFailure::ConnectionRefused,
            "timeout" => TransportFailure::Timeout,
            "dns-failure" => TransportFailure::DnsFailure,
            "backend-crashed" => TransportFailure::BackendCrashed,
            "protocol-error" => TransportFailure::Protocol(detail()),
            "http-error" => TransportFailure::Http {
                status: data.get("status")?.as_u64()?.try_into().ok()?,
            },
            "closed" => TransportFailure::Closed,
            "io-error" => TransportFailure::Io(detail()),
            _ => return None,
        };
        Some(failure)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}
