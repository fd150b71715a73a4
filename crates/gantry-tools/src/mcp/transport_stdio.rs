//! MCP stdio transport: a local child process speaking newline-delimited
//! JSON-RPC over stdin/stdout.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;

use gantry_security::CredentialSet;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::JsonRpcMessage;

use super::framed::{ExitHook, FramedProcess};
use super::transport::StopOutcome;

/// Stdio transport for a locally spawned MCP server.
pub struct StdioTransport {
    backend: String,
    command: String,
    args: Vec<String>,
    credentials: CredentialSet,
    exit_hook: OnceLock<ExitHook>,
    process: RwLock<Option<Arc<FramedProcess>>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("backend", &self.backend)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.credentials.env_names())
            .finish()
    }
}

impl StdioTransport {
    pub fn new(
        backend: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        credentials: CredentialSet,
    ) -> Self {
        Self {
            backend: backend.into(),
            command: command.into(),
            args,
            credentials,
            exit_hook: OnceLock::new(),
            process: RwLock::new(None),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub(crate) fn set_exit_hook(&self, hook: ExitHook) {
        if self.exit_hook.set(hook).is_err() {
            tracing::warn!(backend = %self.backend, "exit hook already installed");
        }
    }

    /// Spawn the server process with this backend's environment.
    ///
    /// A running process is kept; one whose output already closed is replaced.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut process = self.process.write().await;
        if let Some(existing) = process.as_ref() {
            if !existing.has_exited() {
                return Ok(());
            }
            tracing::info!(backend = %self.backend, "previous process exited; respawning");
        }

        let mut command = Command::new(&self.command);
        command.args(&self.args).envs(self.credentials.env());

        let hook = self.exit_hook.get().cloned();
        let spawned = FramedProcess::spawn(&self.backend, command, hook).map_err(|e| match e {
            GatewayError::Startup { backend, reason } => GatewayError::Startup {
                backend,
                reason: format!("{reason} (command '{}')", self.command),
            },
            other => other,
        })?;
        *process = Some(Arc::new(spawned));
        Ok(())
    }

    /// Send one request over the process's pipes.
    pub async fn send(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let process = self
            .process
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::transport(&self.backend, TransportFailure::Closed))?;
        process.send(request, timeout).await
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, message: JsonRpcMessage, timeout: Duration) -> Result<(), GatewayError> {
        let process = self
            .process
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::transport(&self.backend, TransportFailure::Closed))?;
        process.notify(message, timeout).await
    }

    /// Close stdin and wait up to `grace` for exit before killing.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, GatewayError> {
        let process = self.process.write().await.take();
        match process {
            Some(process) => process.shutdown(grace).await,
            None => Ok(StopOutcome::Graceful),
        }
    }

    pub async fn kill(&self) -> Result<(), GatewayError> {
        let process = self.process.write().await.take();
        match process {
            Some(process) => process.kill().await,
            None => Ok(()),
        }
    }

    /// OS process id of the running server, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.process.read().await.as_ref().and_then(|p| p.pid())
    }
}
