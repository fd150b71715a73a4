//! Lifecycle manager: concurrent startup and bounded shutdown of backends.
//!
//! Per backend: `unstarted -> starting -> ready | failed`, then `stopped`.
//! `ready` means the adapter's `start()` returned; whether the server inside
//! answers is the health checker's business. One backend's failure never
//! holds up another's startup or shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use gantry_tools::{BackendInstance, RegistrySnapshot, StopOutcome};
use gantry_types::config::GatewayTimeouts;
use gantry_types::model::{BackendState, TransportKind};

/// Extra time allowed past the grace period for a forced stop to finish.
const KILL_ALLOWANCE: Duration = Duration::from_secs(5);

// ============================================================
// Reports
// ============================================================

/// Startup outcome of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStartup {
    pub backend: String,
    pub kind: TransportKind,
    /// `Ready` or `Failed`.
    pub state: BackendState,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Per-backend startup outcomes, sorted by backend name.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub backends: Vec<BackendStartup>,
}

impl StartupReport {
    pub fn get(&self, backend: &str) -> Option<&BackendStartup> {
        self.backends.iter().find(|b| b.backend == backend)
    }

    pub fn ready(&self) -> impl Iterator<Item = &BackendStartup> {
        self.backends.iter().filter(|b| b.state == BackendState::Ready)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BackendStartup> {
        self.backends.iter().filter(|b| b.state == BackendState::Failed)
    }

    pub fn all_ready(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Shutdown outcome of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendShutdown {
    pub backend: String,
    /// `None` when stopping returned an error.
    pub outcome: Option<StopOutcome>,
    pub error: Option<String>,
}

/// Per-backend shutdown outcomes, sorted by backend name.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub backends: Vec<BackendShutdown>,
}

impl ShutdownReport {
    /// Backends that had to be killed or failed to stop cleanly.
    pub fn forced(&self) -> impl Iterator<Item = &BackendShutdown> {
        self.backends
            .iter()
            .filter(|b| b.outcome != Some(StopOutcome::Graceful))
    }

    pub fn is_clean(&self) -> bool {
        self.forced().next().is_none()
    }
}

// ============================================================
// LifecycleManager
// ============================================================

/// Starts and stops every backend of a registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleManager {
    startup_timeout: Duration,
    shutdown_grace: Duration,
}

impl LifecycleManager {
    pub fn new(startup_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_grace,
        }
    }

    pub fn from_timeouts(timeouts: &GatewayTimeouts) -> Self {
        Self::new(timeouts.startup, timeouts.shutdown_grace)
    }

    /// Start all backends concurrently and report each outcome.
    pub async fn start_all(&self, snapshot: &RegistrySnapshot) -> StartupReport {
        let mut tasks = JoinSet::new();
        for backend in snapshot.backends() {
            let backend = backend.clone();
            let timeout = self.startup_timeout;
            tasks.spawn(start_backend(backend, timeout));
        }

        let mut backends = Vec::with_capacity(snapshot.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => backends.push(outcome),
                Err(e) => tracing::error!(error = %e, "backend startup task panicked"),
            }
        }
        backends.sort_by(|a, b| a.backend.cmp(&b.backend));

        let report = StartupReport { backends };
        tracing::info!(
            ready = report.ready().count(),
            failed = report.failed().count(),
            "backend startup complete"
        );
        report
    }

    /// Stop every `starting` or `ready` backend concurrently within the grace period.
    pub async fn shutdown_all(&self, snapshot: &RegistrySnapshot) -> ShutdownReport {
        let mut tasks = JoinSet::new();
        for backend in snapshot.backends() {
            if !backend.state().needs_stop() {
                continue;
            }
            let backend = backend.clone();
            let grace = self.shutdown_grace;
            tasks.spawn(stop_backend(backend, grace));
        }

        let mut backends = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => backends.push(outcome),
                Err(e) => tracing::error!(error = %e, "backend shutdown task panicked"),
            }
        }
        backends.sort_by(|a, b| a.backend.cmp(&b.backend));

        let report = ShutdownReport { backends };
        tracing::info!(
            stopped = report.backends.len(),
            forced = report.forced().count(),
            "backend shutdown complete"
        );
        report
    }
}

async fn start_backend(backend: Arc<BackendInstance>, timeout: Duration) -> BackendStartup {
    let started = Instant::now();
    backend.set_state(BackendState::Starting);
    tracing::info!(backend = %backend.name(), transport = %backend.kind(), "starting backend");

    // Image pulls have their own retry policy and are not bounded by `timeout`.
    let prepared = backend.transport().prepare().await;
    let error = match prepared {
        Err(e) => Some(e.to_string()),
        Ok(()) => match tokio::time::timeout(timeout, backend.transport().start()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => {
                // A half-started process or container must not outlive the failed start.
                if let Err(e) = backend.transport().kill().await {
                    tracing::warn!(backend = %backend.name(), error = %e, "cleanup after startup timeout failed");
                }
                Some(format!(
                    "backend '{}' did not start within {}s",
                    backend.name(),
                    timeout.as_secs_f64()
                ))
            }
        },
    };

    match error {
        None => backend.set_state(BackendState::Ready),
        Some(reason) => backend.mark_failed(reason),
    }

    // A process that exited right after spawning lands in `failed` here too.
    let state = backend.state();
    let error = match state {
        BackendState::Ready => {
            tracing::info!(
                backend = %backend.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "backend ready"
            );
            None
        }
        _ => {
            let reason = backend.last_error().unwrap_or_else(|| "unknown error".to_string());
            tracing::error!(backend = %backend.name(), error = %reason, "backend failed to start");
            Some(reason)
        }
    };

    BackendStartup {
        backend: backend.name().to_string(),
        kind: backend.kind(),
        state,
        error,
        elapsed: started.elapsed(),
    }
}

async fn stop_backend(backend: Arc<BackendInstance>, grace: Duration) -> BackendShutdown {
    tracing::info!(backend = %backend.name(), "stopping backend");

    let result = match tokio::time::timeout(grace + KILL_ALLOWANCE, backend.transport().stop(grace)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => match backend.transport().kill().await {
            Ok(()) => Ok(StopOutcome::Killed),
            Err(e) => Err(format!("stop timed out and kill failed: {e}")),
        },
    };
    backend.set_state(BackendState::Stopped);

    match result {
        Ok(outcome) => {
            if outcome == StopOutcome::Killed {
                tracing::warn!(
                    backend = %backend.name(),
                    grace_secs = grace.as_secs_f64(),
                    "backend did not stop within grace period; killed"
                );
            }
            BackendShutdown {
                backend: backend.name().to_string(),
                outcome: Some(outcome),
                error: None,
            }
        }
        Err(error) => {
            tracing::error!(backend = %backend.name(), error = %error, "backend stop failed");
            BackendShutdown {
                backend: backend.name().to_string(),
                outcome: None,
                error: Some(error),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gantry_security::CredentialSet;
    use gantry_tools::{Transport, TransportOptions};
    use gantry_types::config::BackendSpec;
    use std::os::unix::fs::PermissionsExt;

    fn shell_spec(script: &str) -> BackendSpec {
        BackendSpec {
            command: Some("/bin/sh".into()),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    fn snapshot(backends: Vec<(&str, BackendSpec)>, options: &TransportOptions) -> RegistrySnapshot {
        let mut builder = RegistrySnapshot::builder();
        for (name, spec) in backends {
            let transport =
                Transport::from_spec(name, &spec, CredentialSet::empty(name), options).unwrap();
            builder
                .register(BackendInstance::new(name, spec, transport))
                .unwrap();
        }
        builder.build()
    }

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Duration::from_secs(5), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let options = TransportOptions::default();
        let snapshot = snapshot(
            vec![
                ("search", shell_spec("cat")),
                (
                    "broken",
                    BackendSpec {
                        command: Some("/nonexistent/gantry-test-binary".into()),
                        ..Default::default()
                    },
                ),
                (
                    "github",
                    BackendSpec {
                        url: Some("http://localhost:9000".into()),
                        ..Default::default()
                    },
                ),
            ],
            &options,
        );

        let report = manager().start_all(&snapshot).await;
        let names: Vec<&str> = report.backends.iter().map(|b| b.backend.as_str()).collect();
        assert_eq!(names, vec!["broken", "github", "search"]);
        assert_eq!(report.ready().count(), 2);
        assert!(!report.all_ready());

        let broken = report.get("broken").unwrap();
        assert_eq!(broken.state, BackendState::Failed);
        assert!(broken.error.as_deref().unwrap().contains("gantry-test-binary"));
        assert_eq!(snapshot.backend("broken").unwrap().state(), BackendState::Failed);
        assert!(snapshot.backend("broken").unwrap().last_error().is_some());
        assert_eq!(snapshot.backend("search").unwrap().state(), BackendState::Ready);

        let shutdown = manager().shutdown_all(&snapshot).await;
        // The failed backend owns nothing and is not stopped.
        let stopped: Vec<&str> = shutdown.backends.iter().map(|b| b.backend.as_str()).collect();
        assert_eq!(stopped, vec!["github", "search"]);
        assert!(shutdown.is_clean());
        assert_eq!(snapshot.backend("search").unwrap().state(), BackendState::Stopped);
        assert_eq!(snapshot.backend("broken").unwrap().state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_stubborn_backend_is_killed_and_recorded() {
        let options = TransportOptions::default();
        let snapshot = snapshot(
            vec![
                ("stubborn", shell_spec("exec sleep 30")),
                ("polite", shell_spec("cat")),
            ],
            &options,
        );
        manager().start_all(&snapshot).await;

        let started = std::time::Instant::now();
        let report = manager().shutdown_all(&snapshot).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let forced: Vec<&str> = report.forced().map(|b| b.backend.as_str()).collect();
        assert_eq!(forced, vec!["stubborn"]);
        assert_eq!(
            report.backends.iter().find(|b| b.backend == "polite").unwrap().outcome,
            Some(StopOutcome::Graceful)
        );
        for backend in snapshot.backends() {
            assert_eq!(backend.state(), BackendState::Stopped);
        }
    }

    /// Write an executable stand-in for the container runtime.
    fn fake_runtime(dir: &std::path::Path, script: &str) -> TransportOptions {
        let runtime = dir.join("fake-runtime");
        std::fs::write(&runtime, format!("#!/bin/sh\n{script}")).unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
        TransportOptions {
            container_runtime: runtime.display().to_string(),
            ..Default::default()
        }
    }

    fn container_spec() -> BackendSpec {
        BackendSpec {
            container: Some("mcp/fs".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_image_pull_is_outside_startup_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let options = fake_runtime(
            dir.path(),
            r#"case "$1" in
  image) exit 1 ;;
  pull) sleep 1; exit 0 ;;
  run) exec cat ;;
  *) exit 0 ;;
esac
"#,
        );
        let snapshot = snapshot(vec![("fs", container_spec())], &options);

        let manager = LifecycleManager::new(Duration::from_millis(500), Duration::from_secs(1));
        let report = manager.start_all(&snapshot).await;
        let fs = report.get("fs").unwrap();
        assert_eq!(fs.state, BackendState::Ready, "{:?}", fs.error);
        assert!(fs.elapsed >= Duration::from_secs(1));

        assert!(manager.shutdown_all(&snapshot).await.is_clean());
    }

    #[tokio::test]
    async fn test_startup_timeout_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        // The first container exits at once; restarting must remove it, which hangs.
        let options = fake_runtime(
            dir.path(),
            r#"case "$1" in
  image) exit 0 ;;
  run) exit 0 ;;
  rm) sleep 10 ;;
esac
"#,
        );
        let snapshot = snapshot(vec![("fs", container_spec())], &options);
        let manager = LifecycleManager::new(Duration::from_millis(200), Duration::from_secs(1));
        manager.start_all(&snapshot).await;
        let fs = snapshot.backend("fs").unwrap();
        for _ in 0..50 {
            if fs.state() == BackendState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let report = manager.start_all(&snapshot).await;
        let fs = report.get("fs").unwrap();
        assert_eq!(fs.state, BackendState::Failed);
        assert!(fs.error.as_deref().unwrap().contains("did not start within"), "{:?}", fs.error);
        assert!(fs.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_process_exiting_after_spawn_is_failed() {
        let options = TransportOptions::default();
        let snapshot = snapshot(
            vec![("crashy", shell_spec("exit 3")), ("steady", shell_spec("cat"))],
            &options,
        );
        manager().start_all(&snapshot).await;

        let crashy = snapshot.backend("crashy").unwrap();
        for _ in 0..100 {
            if crashy.state() == BackendState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(crashy.state(), BackendState::Failed);
        assert_eq!(crashy.last_error().as_deref(), Some(gantry_tools::BACKEND_CRASHED));
        assert_eq!(snapshot.backend("steady").unwrap().state(), BackendState::Ready);

        let shutdown = manager().shutdown_all(&snapshot).await;
        let stopped: Vec<&str> = shutdown.backends.iter().map(|b| b.backend.as_str()).collect();
        assert_eq!(stopped, vec!["steady"]);
    }
}
