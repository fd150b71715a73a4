//! MCP container transport: the same newline-delimited JSON-RPC framing as
//! stdio, with the server running inside `<runtime> run -i --rm`.
//!
//! The transport owns the container's whole lifecycle. A [`ContainerGuard`]
//! is armed before the runtime is invoked and removes the container on drop,
//! so every exit path (spawn failure, panic, forgotten stop) cleans up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;

use gantry_security::CredentialSet;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::JsonRpcMessage;

use super::framed::{ExitHook, FramedProcess};
use super::transport::StopOutcome;

/// Upper bound for housekeeping runtime calls (`image inspect`, `rm -f`).
const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================
// Image acquisition
// ============================================================

/// Retry policy for `<runtime> pull`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one.
    pub initial_backoff: Duration,
    /// Hard limit for a single pull.
    pub attempt_timeout: Duration,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

impl PullPolicy {
    /// Delay before the attempt with zero-based index `attempt` (none before the first).
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => self.initial_backoff * 2u32.saturating_pow(n - 1),
        }
    }
}

/// Make sure `image` is present locally, pulling it under `policy` if not.
pub async fn ensure_image(
    backend: &str,
    runtime: &str,
    image: &str,
    policy: &PullPolicy,
) -> Result<(), GatewayError> {
    let inspect = Command::new(runtime)
        .args(["image", "inspect", image])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status();
    if let Ok(Ok(status)) = tokio::time::timeout(RUNTIME_CALL_TIMEOUT, inspect).await {
        if status.success() {
            tracing::debug!(backend, image, "image already present");
            return Ok(());
        }
    }

    let mut last_error = String::from("no pull attempted");
    for attempt in 0..policy.max_attempts {
        let delay = policy.backoff_before(attempt);
        if !delay.is_zero() {
            tracing::info!(
                backend,
                image,
                attempt = attempt + 1,
                delay_secs = delay.as_secs_f64(),
                "retrying image pull after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let pull = Command::new(runtime)
            .args(["pull", image])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(policy.attempt_timeout, pull).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(backend, image, attempt = attempt + 1, "image pulled");
                return Ok(());
            }
            Ok(Ok(output)) => {
                last_error = format!(
                    "pull exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(Err(e)) => last_error = format!("failed to run '{runtime} pull': {e}"),
            Err(_) => {
                last_error = format!(
                    "pull timed out after {}s",
                    policy.attempt_timeout.as_secs()
                )
            }
        }
        tracing::warn!(backend, image, attempt = attempt + 1, error = %last_error, "image pull failed");
    }

    Err(GatewayError::Startup {
        backend: backend.to_string(),
        reason: format!(
            "could not pull image '{image}' after {} attempts: {last_error}",
            policy.max_attempts
        ),
    })
}

// ============================================================
// Container guard
// ============================================================

/// Removes a named container when dropped, unless disarmed.
#[derive(Debug)]
pub struct ContainerGuard {
    runtime: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(runtime: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            name: name.into(),
            armed: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the container now. Disarms the guard once the runtime ran.
    pub async fn remove(&mut self) -> Result<(), GatewayError> {
        let rm = Command::new(&self.runtime)
            .args(["rm", "-f", &self.name])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(RUNTIME_CALL_TIMEOUT, rm).await {
            Ok(Ok(status)) => {
                // `--rm` may already have removed it; a failing `rm -f` is fine.
                tracing::debug!(container = %self.name, %status, "container removed");
                self.armed = false;
                Ok(())
            }
            Ok(Err(e)) => Err(GatewayError::Io(format!(
                "failed to run '{} rm -f {}': {e}",
                self.runtime, self.name
            ))),
            Err(_) => Err(GatewayError::Io(format!(
                "'{} rm -f {}' timed out",
                self.runtime, self.name
            ))),
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(container = %self.name, "removing container from drop guard");
        let runtime = self.runtime.clone();
        let name = self.name.clone();
        // Blocking wait on a plain thread; Drop may run inside the runtime.
        std::thread::spawn(move || {
            let _ = std::process::Command::new(runtime)
                .args(["rm", "-f", &name])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        });
    }
}

/// Container name for one run of `backend`: `gantry-<backend>-<8 hex>`.
pub fn container_name(backend: &str) -> String {
    let sanitized: String = backend
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("gantry-{sanitized}-{}", &suffix[..8])
}

/// Arguments for `<runtime> run`.
///
/// Environment is passed as `-e NAME` only; values travel through the
/// runtime process's own environment and never appear in its argv.
pub fn run_args(name: &str, env_names: &[&str], image: &str, entrypoint_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    for env_name in env_names {
        args.push("-e".to_string());
        args.push((*env_name).to_string());
    }
    args.push(image.to_string());
    args.extend(entrypoint_args.iter().cloned());
    args
}

// ============================================================
// ContainerTransport
// ============================================================

struct ContainerSession {
    process: Arc<FramedProcess>,
    guard: ContainerGuard,
}

/// Container transport settings.
#[derive(Debug, Clone)]
pub struct ContainerTransportConfig {
    pub runtime: String,
    pub image: String,
    pub entrypoint_args: Vec<String>,
    pub pull_policy: PullPolicy,
}

/// Transport for an MCP server running in a sandboxed container.
pub struct ContainerTransport {
    backend: String,
    config: ContainerTransportConfig,
    credentials: CredentialSet,
    /// Set once the image is known to be present locally.
    image_ready: AtomicBool,
    exit_hook: OnceLock<ExitHook>,
    session: RwLock<Option<ContainerSession>>,
}

impl std::fmt::Debug for ContainerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerTransport")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("env", &self.credentials.env_names())
            .finish()
    }
}

impl ContainerTransport {
    pub fn new(
        backend: impl Into<String>,
        config: ContainerTransportConfig,
        credentials: CredentialSet,
    ) -> Self {
        Self {
            backend: backend.into(),
            config,
            credentials,
            image_ready: AtomicBool::new(false),
            exit_hook: OnceLock::new(),
            session: RwLock::new(None),
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

    /// Make sure the image is present, pulling it under the pull policy.
    ///
    /// A pull may take minutes, so callers bounding startup run this first,
    /// outside their startup deadline. Later calls return immediately.
    pub async fn prepare(&self) -> Result<(), GatewayError> {
        if self.image_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        ensure_image(
            &self.backend,
            &self.config.runtime,
            &self.config.image,
            &self.config.pull_policy,
        )
        .await?;
        self.image_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Start the container, acquiring the image first if [`prepare`](Self::prepare)
    /// has not.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.prepare().await?;

        let mut session = self.session.write().await;
        if let Some(existing) = session.as_ref() {
            if !existing.process.has_exited() {
                return Ok(());
            }
        }
        if let Some(mut stale) = session.take() {
            if let Err(e) = stale.guard.remove().await {
                tracing::warn!(backend = %self.backend, error = %e, "failed to remove exited container");
            }
        }

        let name = container_name(&self.backend);
        let guard = ContainerGuard::new(&self.config.runtime, &name);

        let mut command = Command::new(&self.config.runtime);
        command
            .args(run_args(
                &name,
                &self.credentials.env_names(),
                &self.config.image,
                &self.config.entrypoint_args,
            ))
            .envs(self.credentials.env());

        // On failure `guard` drops here and removes anything the runtime created.
        let hook = self.exit_hook.get().cloned();
        let process = FramedProcess::spawn(&self.backend, command, hook)?;
        tracing::info!(backend = %self.backend, container = %name, image = %self.config.image, "container started");

        *session = Some(ContainerSession {
            process: Arc::new(process),
            guard,
        });
        Ok(())
    }

    pub async fn send(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let process = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.process.clone())
            .ok_or_else(|| GatewayError::transport(&self.backend, TransportFailure::Closed))?;
        process.send(request, timeout).await
    }

    pub async fn notify(&self, message: JsonRpcMessage, timeout: Duration) -> Result<(), GatewayError> {
        let process = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.process.clone())
            .ok_or_else(|| GatewayError::transport(&self.backend, TransportFailure::Closed))?;
        process.notify(message, timeout).await
    }

    /// Close stdin, wait up to `grace`, then force-remove the container.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, GatewayError> {
        let Some(mut session) = self.session.write().await.take() else {
            return Ok(StopOutcome::Graceful);
        };
        let outcome = session.process.shutdown(grace).await;
        session.guard.remove().await?;
        outcome
    }

    pub async fn kill(&self) -> Result<(), GatewayError> {
        let Some(mut session) = self.session.write().await.take() else {
            return Ok(());
        };
        let killed = session.process.kill().await;
        session.guard.remove().await?;
        killed
    }

    /// Name of the running container, if any.
    pub async fn container_name(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.guard.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_backoff_doubles_from_five_seconds() {
        let policy = PullPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(300));
        assert_eq!(policy.backoff_before(0), Duration::ZERO);
        assert_eq!(policy.backoff_before(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_before(2), Duration::from_secs(10));
    }

    #[test]
    fn test_container_name_is_sanitized_and_unique() {
        let a = container_name("my server/1");
        let b = container_name("my server/1");
        assert!(a.starts_with("gantry-my-server-1-"), "{a}");
        assert_eq!(a.len(), "gantry-my-server-1-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_args_keep_secret_values_out_of_argv() {
        let args = run_args(
            "gantry-fs-1234abcd",
            &["API_TOKEN"],
            "mcp/filesystem:latest",
            &["/data".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "run", "-i", "--rm", "--name", "gantry-fs-1234abcd", "-e", "API_TOKEN",
                "mcp/filesystem:latest", "/data",
            ]
        );
    }

    #[cfg(unix)]
    mod fake_runtime {
        use super::*;
        use serde_json::json;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        /// A stand-in for `docker` that logs its argv and fails the first
        /// `failing_pulls` pulls. `run` becomes an echo server.
        fn write_runtime(dir: &Path, failing_pulls: u32) -> PathBuf {
            let log = dir.join("calls.log");
            let count = dir.join("pulls");
            let script = format!(
                r#"#!/bin/sh
echo "$*" >> "{log}"
case "$1" in
  image) exit 1 ;;
  pull)
    n=$(cat "{count}" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > "{count}"
    if [ "$n" -le {failing_pulls} ]; then echo "registry unavailable" >&2; exit 1; fi
    exit 0 ;;
  run)
    while IFS= read -r line; do
      id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"token":"%s"}}}}\n' "$id" "$API_TOKEN"
    done ;;
  rm) exit 0 ;;
esac
"#,
                log = log.display(),
                count = count.display(),
            );
            let path = dir.join("fake-runtime");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn calls(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn fast_policy() -> PullPolicy {
            PullPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(5),
            }
        }

        #[tokio::test]
        async fn test_pull_retries_transient_failures() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = write_runtime(dir.path(), 2);

            ensure_image("fs", runtime.to_str().unwrap(), "mcp/fs", &fast_policy())
                .await
                .unwrap();
            let pulls = calls(dir.path()).iter().filter(|c| c.starts_with("pull")).count();
            assert_eq!(pulls, 3);
        }

        #[tokio::test]
        async fn test_pull_gives_up_after_max_attempts() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = write_runtime(dir.path(), 10);

            let err = ensure_image("fs", runtime.to_str().unwrap(), "mcp/fs", &fast_policy())
                .await
                .unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("after 3 attempts"), "{msg}");
            assert!(msg.contains("registry unavailable"), "{msg}");
        }

        #[tokio::test]
        async fn test_container_round_trip_and_cleanup() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = write_runtime(dir.path(), 0);

            let mut credentials_spec = gantry_types::config::BackendSpec {
                container: Some("mcp/fs".into()),
                ..Default::default()
            };
            credentials_spec
                .env
                .insert("API_TOKEN".into(), "container-secret".into());
            let broker = gantry_security::SecretBroker::from_env().unwrap();
            let credentials = broker.resolve("fs", &credentials_spec).unwrap();

            let transport = ContainerTransport::new(
                "fs",
                ContainerTransportConfig {
                    runtime: runtime.to_str().unwrap().to_string(),
                    image: "mcp/fs".into(),
                    entrypoint_args: vec!["/data".into()],
                    pull_policy: fast_policy(),
                },
                credentials,
            );
            transport.start().await.unwrap();
            let name = transport.container_name().await.unwrap();

            let response = transport
                .send(JsonRpcMessage::request(4, "ping", None), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(response.id, Some(json!(4)));
            assert_eq!(response.result.unwrap()["token"], "container-secret");

            assert_eq!(
                transport.stop(Duration::from_secs(5)).await.unwrap(),
                StopOutcome::Graceful
            );

            let calls = calls(dir.path());
            let run = calls.iter().find(|c| c.starts_with("run")).unwrap();
            assert!(run.contains(&format!("--name {name} -e API_TOKEN mcp/fs /data")), "{run}");
            assert!(!run.contains("container-secret"));
            assert!(calls.contains(&format!("rm -f {name}")), "{calls:?}");
        }

        #[tokio::test]
        async fn test_guard_removes_container_on_drop() {
            let dir = tempfile::tempdir().unwrap();
            let runtime = write_runtime(dir.path(), 0);

            drop(ContainerGuard::new(runtime.to_str().unwrap(), "gantry-x-00000000"));

            let mut removed = false;
            for _ in 0..50 {
                if calls(dir.path()).contains(&"rm -f gantry-x-00000000".to_string()) {
                    removed = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(removed);

            let mut disarmed = ContainerGuard::new(runtime.to_str().unwrap(), "gantry-y-00000000");
            disarmed.disarm();
            drop(disarmed);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!calls(dir.path()).iter().any(|c| c.contains("gantry-y")));
        }
    }
}
