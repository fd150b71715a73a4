//! In-process ping targets: a registered backend pinged through its own adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use gantry_tools::BackendInstance;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::{JsonRpcMessage, TransportKind};
use gantry_types::traits::PingTarget;

/// Pings one backend over its transport adapter.
///
/// Stdio and container backends are skipped unless `include_framed` is set.
#[derive(Debug, Clone)]
pub struct BackendPing {
    backend: Arc<BackendInstance>,
    include_framed: bool,
}

impl BackendPing {
    pub fn new(backend: Arc<BackendInstance>, include_framed: bool) -> Self {
        Self {
            backend,
            include_framed,
        }
    }
}

#[async_trait]
impl PingTarget for BackendPing {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn skip_reason(&self) -> Option<String> {
        let kind = self.backend.kind();
        if kind != TransportKind::Http && !self.include_framed {
            return Some(format!("no HTTP endpoint ({kind} transport)"));
        }
        None
    }

    async fn ping(&self, timeout: Duration) -> Result<JsonRpcMessage, TransportFailure> {
        let request = JsonRpcMessage::request(0, "ping", None);
        self.backend
            .call(request, timeout)
            .await
            .map_err(into_failure)
    }
}

/// Collapse a gateway error onto the transport taxonomy the checker reports.
pub(crate) fn into_failure(err: GatewayError) -> TransportFailure {
    match err {
        GatewayError::Transport { failure, .. } => failure,
        GatewayError::Serialization(message) => TransportFailure::Protocol(message),
        other => TransportFailure::Io(other.to_string()),
    }
}
