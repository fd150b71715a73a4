//! Request router: maps an agent's call to the backend that owns the tool.
//!
//! Checks, in order, before anything is forwarded:
//! - the tool has a route (`tool-not-found`)
//! - the owning backend is `ready` (`backend-unavailable`)
//! - the backend's allow filter admits the tool (`tool-not-allowed`)
//!
//! The router never retries. Transport failures and application errors go
//! back to the caller as they came.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;

use gantry_tools::{BackendInstance, RegistrySnapshot, ServerRegistry};
use gantry_types::errors::GatewayError;
use gantry_types::model::{BackendState, JsonRpcMessage, McpToolDef};

use crate::discovery;

/// A backend's response, tagged with the backend that produced it.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub backend: String,
    pub message: JsonRpcMessage,
}

impl RoutedResponse {
    /// Split into the result, or an application error if the backend returned one.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        match self.message.error {
            Some(error) => Err(GatewayError::Application {
                backend: self.backend,
                error,
            }),
            None => Ok(self.message.result.unwrap_or(Value::Null)),
        }
    }
}

/// Routes agent calls over the current registry snapshot.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    registry: Arc<ServerRegistry>,
    request_timeout: Duration,
}

impl RequestRouter {
    pub fn new(registry: Arc<ServerRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Find the backend that may serve `tool` right now.
    pub async fn resolve(&self, tool: &str) -> Result<Arc<BackendInstance>, GatewayError> {
        let snapshot = self.registry.snapshot().await;
        resolve_in(&snapshot, tool)
    }

    /// Route a `tools/call` request by its `params.name`.
    pub async fn call_tool(&self, request: JsonRpcMessage) -> Result<RoutedResponse, GatewayError> {
        let tool = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::InvalidRequest("tools/call requires a string params.name".to_string())
            })?
            .to_string();

        let backend = self.resolve(&tool).await?;
        tracing::debug!(tool = %tool, backend = %backend.name(), "routing tool call");

        let message = backend.call(request, self.request_timeout).await.map_err(|e| {
            tracing::warn!(tool = %tool, backend = %backend.name(), error = %e, "routed call failed");
            e
        })?;
        Ok(RoutedResponse {
            backend: backend.name().to_string(),
            message,
        })
    }

    /// Forward any request to a named backend without tool resolution.
    pub async fn forward(
        &self,
        backend_name: &str,
        request: JsonRpcMessage,
    ) -> Result<RoutedResponse, GatewayError> {
        let backend = self.ready_backend(backend_name).await?;
        let message = backend.call(request, self.request_timeout).await?;
        Ok(RoutedResponse {
            backend: backend.name().to_string(),
            message,
        })
    }

    /// Forward a notification to a named backend. Nothing comes back.
    pub async fn forward_notification(
        &self,
        backend_name: &str,
        message: JsonRpcMessage,
    ) -> Result<(), GatewayError> {
        let backend = self.ready_backend(backend_name).await?;
        backend.notify(message, self.request_timeout).await
    }

    async fn ready_backend(&self, name: &str) -> Result<Arc<BackendInstance>, GatewayError> {
        let snapshot = self.registry.snapshot().await;
        let backend = snapshot
            .backend(name)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown backend '{name}'")))?;
        ensure_ready(&backend)?;
        Ok(backend)
    }

    /// Every routed, allowed tool across ready backends, sorted by name.
    ///
    /// A backend whose `tools/list` fails is left out with a warning.
    pub async fn list_tools(&self) -> Vec<McpToolDef> {
        let snapshot = self.registry.snapshot().await;
        let mut tasks = JoinSet::new();
        for backend in snapshot.backends() {
            if backend.state() != BackendState::Ready {
                continue;
            }
            let backend = backend.clone();
            let timeout = self.request_timeout;
            tasks.spawn(async move {
                let listed = discovery::list_tools(&backend, timeout).await;
                (backend, listed)
            });
        }

        let mut tools = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (backend, listed) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "tools/list task panicked");
                    continue;
                }
            };
            match listed {
                Ok(listed) => tools.extend(
                    backend
                        .filter()
                        .filter_tool_list(listed)
                        .into_iter()
                        .filter(|tool| routes_to(&snapshot, &tool.name, backend.name())),
                ),
                Err(e) => {
                    tracing::warn!(backend = %backend.name(), error = %e, "tools/list failed; omitting backend");
                }
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// The three routing checks against one snapshot.
pub fn resolve_in(
    snapshot: &RegistrySnapshot,
    tool: &str,
) -> Result<Arc<BackendInstance>, GatewayError> {
    let route = snapshot
        .route(tool)
        .ok_or_else(|| GatewayError::ToolNotFound(tool.to_string()))?;
    let backend = route.backend.clone();
    ensure_ready(&backend)?;
    if !backend.filter().is_allowed(tool) {
        return Err(GatewayError::ToolNotAllowed {
            tool: tool.to_string(),
            backend: backend.name().to_string(),
        });
    }
    Ok(backend)
}

fn ensure_ready(backend: &BackendInstance) -> Result<(), GatewayError> {
    match backend.state() {
        BackendState::Ready => Ok(()),
        state => Err(GatewayError::BackendUnavailable {
            backend: backend.name().to_string(),
            state,
        }),
    }
}

fn routes_to(snapshot: &RegistrySnapshot, tool: &str, backend: &str) -> bool {
    snapshot
        .route(tool)
        .is_some_and(|route| route.backend.name() == backend)
}
