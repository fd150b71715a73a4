//! The uniform transport contract over the three backend kinds.
//!
//! [`Transport`] is a closed sum type: the router, lifecycle manager and
//! health checker only ever call `start` / `send` / `stop` on it and never
//! look at which variant they hold.

use std::time::Duration;

use gantry_security::CredentialSet;
use gantry_types::config::{BackendSpec, TransportTarget};
use gantry_types::errors::GatewayError;
use gantry_types::model::{JsonRpcMessage, TransportKind};

use super::framed::ExitHook;
use super::transport_container::{ContainerTransport, ContainerTransportConfig, PullPolicy};
use super::transport_http::{HttpTransport, HttpTransportConfig};
use super::transport_stdio::StdioTransport;

/// How a transport came down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited (or closed) within the grace period.
    Graceful,
    /// Had to be forcefully terminated after the grace period.
    Killed,
}

/// Gateway-wide settings that shape how transports are built.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Container runtime binary (`docker`, `podman`).
    pub container_runtime: String,
    pub pull_policy: PullPolicy,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            container_runtime: "docker".to_string(),
            pull_policy: PullPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One backend's transport adapter.
#[derive(Debug)]
pub enum Transport {
    Stdio(StdioTransport),
    Container(ContainerTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Build the adapter a spec selects, carrying only `credentials`.
    pub fn from_spec(
        backend: &str,
        spec: &BackendSpec,
        credentials: CredentialSet,
        options: &TransportOptions,
    ) -> Result<Self, GatewayError> {
        if credentials.backend() != backend {
            return Err(GatewayError::Internal(format!(
                "credentials for '{}' handed to backend '{backend}'",
                credentials.backend()
            )));
        }

        let transport = match spec.transport_target(backend)? {
            TransportTarget::Stdio { command, args } => {
                Transport::Stdio(StdioTransport::new(backend, command, args, credentials))
            }
            TransportTarget::Container {
                image,
                entrypoint_args,
            } => Transport::Container(ContainerTransport::new(
                backend,
                ContainerTransportConfig {
                    runtime: options.container_runtime.clone(),
                    image,
                    entrypoint_args,
                    pull_policy: options.pull_policy,
                },
                credentials,
            )),
            TransportTarget::Http { url } => {
                let mut config = HttpTransportConfig::new(url, credentials);
                config.connect_timeout = options.connect_timeout;
                Transport::Http(HttpTransport::new(backend, config)?)
            }
        };
        Ok(transport)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stdio(_) => TransportKind::Stdio,
            Transport::Container(_) => TransportKind::Container,
            Transport::Http(_) => TransportKind::Http,
        }
    }

    pub fn backend(&self) -> &str {
        match self {
            Transport::Stdio(t) => t.backend(),
            Transport::Container(t) => t.backend(),
            Transport::Http(t) => t.backend(),
        }
    }

    /// Run `hook` whenever a stdio or container process exits without being
    /// stopped. HTTP backends have no process to watch.
    pub(crate) fn set_exit_hook(&self, hook: ExitHook) {
        match self {
            Transport::Stdio(t) => t.set_exit_hook(hook),
            Transport::Container(t) => t.set_exit_hook(hook),
            Transport::Http(_) => {}
        }
    }

    /// Acquire what `start()` needs but may take unbounded time to fetch:
    /// the container image. A no-op for stdio and HTTP.
    pub async fn prepare(&self) -> Result<(), GatewayError> {
        match self {
            Transport::Container(t) => t.prepare().await,
            Transport::Stdio(_) | Transport::Http(_) => Ok(()),
        }
    }

    /// Spawn the process, start the container, or open the HTTP client.
    pub async fn start(&self) -> Result<(), GatewayError> {
        match self {
            Transport::Stdio(t) => t.start().await,
            Transport::Container(t) => t.start().await,
            Transport::Http(t) => t.start().await,
        }
    }

    /// Send one request and wait at most `timeout` for its response.
    ///
    /// `Ok` means a parsed JSON-RPC response came back, which may still carry
    /// an application-level `error`.
    pub async fn send(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        match self {
            Transport::Stdio(t) => t.send(request, timeout).await,
            Transport::Container(t) => t.send(request, timeout).await,
            Transport::Http(t) => t.send(request, timeout).await,
        }
    }

    /// Send a notification (a message without an id); no response is read.
    pub async fn notify(&self, message: JsonRpcMessage, timeout: Duration) -> Result<(), GatewayError> {
        match self {
            Transport::Stdio(t) => t.notify(message, timeout).await,
            Transport::Container(t) => t.notify(message, timeout).await,
            Transport::Http(t) => t.notify(message, timeout).await,
        }
    }

    /// Stop within `grace`, forcefully if needed.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, GatewayError> {
        match self {
            Transport::Stdio(t) => t.stop(grace).await,
            Transport::Container(t) => t.stop(grace).await,
            Transport::Http(t) => t.stop().await.map(|()| StopOutcome::Graceful),
        }
    }

    /// Terminate immediately.
    pub async fn kill(&self) -> Result<(), GatewayError> {
        match self {
            Transport::Stdio(t) => t.kill().await,
            Transport::Container(t) => t.kill().await,
            Transport::Http(t) => t.stop().await,
        }
    }
}
