//! Server registry implementation.
//!
//! The registry maps backend names to [`BackendInstance`]s and tool names to
//! [`ToolRoute`]s. A [`RegistrySnapshot`] is immutable once built; changes
//! (reload, route refresh) build a whole new snapshot and swap it in under
//! the [`ServerRegistry`]'s write lock, so routing lookups see either the old
//! registry or the new one and never a mix.
//!
//! Tool names are unique across backends. A second backend claiming a tool
//! is rejected at registration time with the colliding name.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use gantry_types::config::BackendSpec;
use gantry_types::errors::GatewayError;
use gantry_types::model::{BackendState, JsonRpcMessage, TransportKind};

use crate::mcp::tool_filter::ToolFilter;
use crate::mcp::transport::Transport;

// ============================================================
// BackendInstance
// ============================================================

/// Recorded when a backend's process exits without being stopped.
pub const BACKEND_CRASHED: &str = "backend crashed";

#[derive(Debug)]
struct BackendStatus {
    state: BackendState,
    last_error: Option<String>,
    /// The current process exited on its own; cleared by the next start.
    crashed: bool,
}

type SharedStatus = Arc<StdRwLock<BackendStatus>>;

fn write_status(status: &StdRwLock<BackendStatus>) -> std::sync::RwLockWriteGuard<'_, BackendStatus> {
    status.write().unwrap_or_else(|e| e.into_inner())
}

/// Exit hook target: a ready backend whose process dies becomes `failed`.
fn record_crash(name: &str, status: &StdRwLock<BackendStatus>) {
    let mut status = write_status(status);
    status.crashed = true;
    if status.state == BackendState::Ready {
        warn!(backend = %name, "backend process exited; marking failed");
        status.state = BackendState::Failed;
        status.last_error = Some(BACKEND_CRASHED.to_string());
    }
}

/// A backend spec bound to its live transport and lifecycle state.
#[derive(Debug)]
pub struct BackendInstance {
    name: String,
    spec: Arc<BackendSpec>,
    transport: Transport,
    filter: ToolFilter,
    status: SharedStatus,
    /// Source of the ids the gateway puts on outbound requests.
    next_request_id: AtomicU64,
    /// Set once the MCP `initialize` exchange has completed on this transport.
    initialized: AtomicBool,
}

impl BackendInstance {
    pub fn new(name: impl Into<String>, spec: BackendSpec, transport: Transport) -> Self {
        let name = name.into();
        let filter = ToolFilter::from_allowed(spec.allowed.as_deref());
        let status: SharedStatus = Arc::new(StdRwLock::new(BackendStatus {
            state: BackendState::Unstarted,
            last_error: None,
            crashed: false,
        }));

        let hook_status = status.clone();
        let hook_name = name.clone();
        transport.set_exit_hook(Arc::new(move || record_crash(&hook_name, &hook_status)));

        Self {
            name,
            spec: Arc::new(spec),
            transport,
            filter,
            status,
            next_request_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn filter(&self) -> &ToolFilter {
        &self.filter
    }

    /// Tool names claimed in configuration (declared plus literal allow entries).
    pub fn declared_tools(&self) -> Vec<String> {
        self.spec.claimed_tool_names()
    }

    pub fn state(&self) -> BackendState {
        self.status.read().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone()
    }

    /// Move to `state`.
    ///
    /// `Ready` is refused for a process that already exited after its start;
    /// the backend becomes `failed` instead.
    pub fn set_state(&self, state: BackendState) {
        let mut status = write_status(&self.status);
        let state = match state {
            BackendState::Ready if status.crashed => {
                status.last_error = Some(BACKEND_CRASHED.to_string());
                BackendState::Failed
            }
            BackendState::Ready => {
                status.last_error = None;
                state
            }
            BackendState::Starting => {
                status.crashed = false;
                self.initialized.store(false, Ordering::Release);
                state
            }
            BackendState::Stopped => {
                self.initialized.store(false, Ordering::Release);
                state
            }
            _ => state,
        };
        if status.state != state {
            debug!(backend = %self.name, from = %status.state, to = %state, "backend state change");
        }
        status.state = state;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Move to `failed`, remembering why.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut status = write_status(&self.status);
        debug!(backend = %self.name, from = %status.state, reason = %reason, "backend failed");
        status.state = BackendState::Failed;
        status.last_error = Some(reason);
    }

    /// Forward one request through the transport.
    ///
    /// The request goes out under a gateway-assigned id; the caller's id is
    /// put back on the response.
    pub async fn call(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let caller_id = request.id.clone();
        let mut outbound = request;
        let gateway_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        outbound.id = Some(serde_json::Value::from(gateway_id));

        let mut response = self.transport.send(outbound, timeout).await?;
        response.id = caller_id;
        Ok(response)
    }

    /// Forward a notification; there is no response to wait for.
    pub async fn notify(
        &self,
        message: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.transport.notify(message, timeout).await
    }
}

// ============================================================
// Routes and snapshots
// ============================================================

/// A tool name bound to the backend that serves it.
#[derive(Debug, Clone)]
pub struct ToolRoute {
    pub tool: String,
    pub backend: Arc<BackendInstance>,
}

/// An immutable registry: backends plus the tool route table.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    backends: HashMap<String, Arc<BackendInstance>>,
    routes: HashMap<String, ToolRoute>,
}

impl RegistrySnapshot {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn backend(&self, name: &str) -> Option<&Arc<BackendInstance>> {
        self.backends.get(name)
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<BackendInstance>> {
        self.backends.values()
    }

    /// Backend names in sorted order.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn route(&self, tool: &str) -> Option<&ToolRoute> {
        self.routes.get(tool)
    }

    /// Tool name → backend name, sorted by tool.
    pub fn route_table(&self) -> BTreeMap<String, String> {
        self.routes
            .iter()
            .map(|(tool, route)| (tool.clone(), route.backend.name().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Rebuild the route table over the same backend instances, adding the
    /// tool names each backend advertised.
    ///
    /// Fails without side effects if an advertised name collides with
    /// another backend's tool.
    pub fn with_advertised_tools(
        &self,
        advertised: &HashMap<String, Vec<String>>,
    ) -> Result<RegistrySnapshot, GatewayError> {
        let mut builder = RegistryBuilder::default();
        let names = self.backend_names();
        for name in &names {
            if let Some(instance) = self.backends.get(name) {
                builder.add_backend(instance.clone())?;
            }
        }
        for name in &names {
            if let Some(tools) = advertised.get(name) {
                builder.add_routes(name, tools.iter().cloned())?;
            }
        }
        Ok(builder.build())
    }
}

/// Collects backends and routes, rejecting collisions as they are added.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    backends: HashMap<String, Arc<BackendInstance>>,
    routes: HashMap<String, ToolRoute>,
}

impl RegistryBuilder {
    /// Register a backend and route its declared tools to it.
    pub fn register(&mut self, instance: BackendInstance) -> Result<Arc<BackendInstance>, GatewayError> {
        let instance = Arc::new(instance);
        self.add_backend(instance.clone())?;
        Ok(instance)
    }

    fn add_backend(&mut self, instance: Arc<BackendInstance>) -> Result<(), GatewayError> {
        let name = instance.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(GatewayError::Config(format!(
                "backend '{name}' is registered twice"
            )));
        }
        let declared = instance.declared_tools();
        self.check_collisions(&name, &declared)?;
        self.backends.insert(name.clone(), instance);
        self.add_routes(&name, declared)
    }

    /// Route additional tool names to an already registered backend.
    pub fn add_routes(
        &mut self,
        backend: &str,
        tools: impl IntoIterator<Item = String>,
    ) -> Result<(), GatewayError> {
        let instance = self
            .backends
            .get(backend)
            .cloned()
            .ok_or_else(|| GatewayError::Internal(format!("unknown backend '{backend}'")))?;
        let tools: Vec<String> = tools.into_iter().collect();
        self.check_collisions(backend, &tools)?;
        for tool in tools {
            self.routes.entry(tool.clone()).or_insert_with(|| ToolRoute {
                tool,
                backend: instance.clone(),
            });
        }
        Ok(())
    }

    fn check_collisions(&self, backend: &str, tools: &[String]) -> Result<(), GatewayError> {
        for tool in tools {
            if let Some(existing) = self.routes.get(tool) {
                if existing.backend.name() != backend {
                    return Err(GatewayError::Config(format!(
                        "tool '{tool}' is claimed by both backend '{}' and backend '{backend}'",
                        existing.backend.name()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn build(self) -> RegistrySnapshot {
        RegistrySnapshot {
            backends: self.backends,
            routes: self.routes,
        }
    }
}

// ============================================================
// ServerRegistry
// ============================================================

/// Shared handle to the current registry snapshot.
///
/// Readers clone the `Arc` and release the lock immediately, so a request in
/// flight keeps using the snapshot it started with.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ServerRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The registry as of now.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().await.clone()
    }

    /// Install `next` and return the snapshot it replaced.
    pub async fn replace(&self, next: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let next = Arc::new(next);
        let mut current = self.current.write().await;
        let previous = std::mem::replace(&mut *current, next);
        info!(
            backends = current.len(),
            routes = current.routes.len(),
            "server registry replaced"
        );
        previous
    }
}
