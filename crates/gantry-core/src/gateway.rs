//! Gateway facade: wires config, credentials, registry, lifecycle, router
//! and health checker together.
//!
//! ```text
//! GatewayConfig ──validate──▶ SecretBroker ──resolve──▶ Transport::from_spec
//!        │                                                    │
//!        └──────────────▶ RegistrySnapshot ◀──────────────────┘
//!                               │
//!              LifecycleManager::start_all ──▶ RequestRouter
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use gantry_security::SecretBroker;
use gantry_tools::{BackendInstance, RegistrySnapshot, ServerRegistry, Transport, TransportOptions};
use gantry_types::config::{GatewayConfig, GatewaySettings, GatewayTimeouts};
use gantry_types::config_loader::ConfigLoader;
use gantry_types::errors::GatewayError;
use gantry_types::model::{BackendState, TransportKind};
use gantry_types::traits::PingTarget;

use crate::discovery;
use crate::health::{BackendPing, HealthChecker, HealthReport};
use crate::lifecycle::{LifecycleManager, ShutdownReport, StartupReport};
use crate::router::RequestRouter;

/// Point-in-time view of one backend, as served by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackendStatusView {
    pub name: String,
    pub transport: TransportKind,
    pub state: BackendState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tools: usize,
}

/// A running gateway.
pub struct Gateway {
    registry: Arc<ServerRegistry>,
    router: RequestRouter,
    lifecycle: LifecycleManager,
    broker: SecretBroker,
    settings: GatewaySettings,
    timeouts: GatewayTimeouts,
    api_key: Option<String>,
    /// Serializes reloads and route refreshes.
    rebuild: Mutex<()>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("port", &self.settings.port)
            .field("timeouts", &self.timeouts)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Validate `config`, build every adapter and start all backends concurrently.
    ///
    /// Configuration errors abort before anything is started. Per-backend
    /// startup failures do not: they are in the returned report.
    pub async fn start(
        config: GatewayConfig,
        broker: SecretBroker,
    ) -> Result<(Self, StartupReport), GatewayError> {
        ConfigLoader::validate(&config)?;
        let timeouts = config.gateway.timeouts()?;
        let api_key = resolve_api_key(&broker, &config.gateway)?;
        let snapshot = build_registry(&config, &broker)?;

        let registry = Arc::new(ServerRegistry::new(snapshot));
        let lifecycle = LifecycleManager::from_timeouts(&timeouts);
        let router = RequestRouter::new(registry.clone(), timeouts.request);

        let gateway = Self {
            registry,
            router,
            lifecycle,
            broker,
            settings: config.gateway,
            timeouts,
            api_key,
            rebuild: Mutex::new(()),
        };
        let snapshot = gateway.registry.snapshot().await;
        let report = gateway.lifecycle.start_all(&*snapshot).await;
        Ok((gateway, report))
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Resolved API key agents must present, if one is configured.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Every backend's current state, sorted by name.
    pub async fn status(&self) -> Vec<BackendStatusView> {
        let snapshot = self.registry.snapshot().await;
        let routes = snapshot.route_table();
        snapshot
            .backend_names()
            .into_iter()
            .filter_map(|name| snapshot.backend(&name).cloned())
            .map(|backend| BackendStatusView {
                name: backend.name().to_string(),
                transport: backend.kind(),
                state: backend.state(),
                last_error: backend.last_error(),
                tools: routes.values().filter(|b| *b == backend.name()).count(),
            })
            .collect()
    }

    /// Handshake with every ready backend, merge the tools they advertise into
    /// the route table and swap it in.
    ///
    /// A collision between advertised names leaves the current table in place.
    /// Returns the new tool → backend table.
    pub async fn refresh_routes(&self) -> Result<BTreeMap<String, String>, GatewayError> {
        let _guard = self.rebuild.lock().await;
        let snapshot = self.registry.snapshot().await;
        let timeout = self.timeouts.request;

        let mut tasks = JoinSet::new();
        for backend in snapshot.backends() {
            if backend.state() != BackendState::Ready {
                continue;
            }
            let backend = backend.clone();
            tasks.spawn(async move {
                let tools = discover(&backend, timeout).await;
                (backend.name().to_string(), tools)
            });
        }

        let mut advertised: HashMap<String, Vec<String>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Some(tools))) => {
                    advertised.insert(name, tools);
                }
                Ok((_, None)) => {}
                Err(e) => tracing::error!(error = %e, "tool discovery task panicked"),
            }
        }

        let next = snapshot.with_advertised_tools(&advertised)?;
        let table = next.route_table();
        self.registry.replace(next).await;
        tracing::info!(routes = table.len(), "tool routes refreshed");
        Ok(table)
    }

    /// Replace every backend with those of `config`.
    ///
    /// The new backends are built and started before the swap; the old ones
    /// are stopped after it. An invalid config changes nothing. Changes to the
    /// `gateway` section take effect on restart only.
    pub async fn reload(&self, config: GatewayConfig) -> Result<StartupReport, GatewayError> {
        let _guard = self.rebuild.lock().await;
        ConfigLoader::validate(&config)?;
        if config.gateway != self.settings {
            tracing::warn!("gateway settings changed; they take effect after a restart");
        }

        let next = build_registry(&config, &self.broker)?;
        let report = self.lifecycle.start_all(&next).await;
        let previous = self.registry.replace(next).await;
        tracing::info!(
            backends = report.backends.len(),
            failed = report.failed().count(),
            "configuration reloaded"
        );

        let stopped = self.lifecycle.shutdown_all(&*previous).await;
        if !stopped.is_clean() {
            tracing::warn!(
                forced = stopped.forced().count(),
                "some replaced backends did not stop cleanly"
            );
        }
        Ok(report)
    }

    /// Ping backends through their adapters with the health checker's schedule.
    ///
    /// Stdio and container backends are skipped unless
    /// `health_check.include_framed` is set.
    pub async fn verify(&self, checker: &HealthChecker) -> HealthReport {
        let snapshot = self.registry.snapshot().await;
        let include_framed = self.settings.health_check.include_framed;
        let targets: Vec<Arc<dyn PingTarget>> = snapshot
            .backend_names()
            .into_iter()
            .filter_map(|name| snapshot.backend(&name).cloned())
            .map(|backend| Arc::new(BackendPing::new(backend, include_framed)) as Arc<dyn PingTarget>)
            .collect();
        checker.check_all(targets).await
    }

    /// Stop every backend within the configured grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _guard = self.rebuild.lock().await;
        let snapshot = self.registry.snapshot().await;
        self.lifecycle.shutdown_all(&*snapshot).await
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.timeouts.shutdown_grace
    }
}

/// Build a registry with one adapter per backend, each holding only its own credentials.
pub fn build_registry(
    config: &GatewayConfig,
    broker: &SecretBroker,
) -> Result<RegistrySnapshot, GatewayError> {
    let options = TransportOptions {
        container_runtime: config.gateway.container_runtime.clone(),
        ..Default::default()
    };

    let mut builder = RegistrySnapshot::builder();
    for (name, spec) in &config.servers {
        let credentials = broker.resolve(name, spec)?;
        let transport = Transport::from_spec(name, spec, credentials, &options)?;
        builder.register(BackendInstance::new(name.as_str(), spec.clone(), transport))?;
    }
    Ok(builder.build())
}

fn resolve_api_key(
    broker: &SecretBroker,
    settings: &GatewaySettings,
) -> Result<Option<String>, GatewayError> {
    let Some(template) = &settings.api_key else {
        return Ok(None);
    };
    let key = broker.expand(template).map_err(|missing| {
        GatewayError::Config(format!(
            "gateway.api_key references unset variable '{missing}'"
        ))
    })?;
    Ok(Some(key).filter(|k| !k.is_empty()))
}

/// Handshake and list tools; `None` keeps the backend's declared routes only.
async fn discover(backend: &BackendInstance, timeout: Duration) -> Option<Vec<String>> {
    if let Err(e) = discovery::ensure_initialized(backend, timeout).await {
        tracing::warn!(backend = %backend.name(), error = %e, "initialize failed; listing tools anyway");
    }
    match discovery::list_tools(backend, timeout).await {
        Ok(tools) => Some(tools.into_iter().map(|t| t.name).collect()),
        Err(e) => {
            tracing::warn!(backend = %backend.name(), error = %e, "tool discovery failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::config::BackendSpec;

    fn broker(vars: &[(&str, &str)]) -> SecretBroker {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SecretBroker::with_lookup(Arc::new(move |name: &str| vars.get(name).cloned())).unwrap()
    }

    fn http(url: &str, tools: &[&str]) -> BackendSpec {
        BackendSpec {
            url: Some(url.to_string()),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn config(servers: Vec<(&str, BackendSpec)>) -> GatewayConfig {
        GatewayConfig {
            servers: servers
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_config_error_aborts_before_start() {
        let cfg = config(vec![
            ("github", http("http://localhost:9000", &["create_issue"])),
            ("gitlab", http("http://localhost:9001", &["create_issue"])),
        ]);
        let err = Gateway::start(cfg, broker(&[])).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("create_issue"));
    }

    #[tokio::test]
    async fn test_missing_credential_variable_is_config_error() {
        let mut spec = http("http://localhost:9000", &[]);
        spec.headers
            .insert("Authorization".into(), "Bearer ${GITHUB_TOKEN}".into());
        let err = Gateway::start(config(vec![("github", spec)]), broker(&[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN"), "{err}");
    }

    #[tokio::test]
    async fn test_api_key_template_resolved() {
        let mut cfg = config(vec![]);
        cfg.gateway.api_key = Some("${GANTRY_API_KEY}".into());
        let (gateway, _) = Gateway::start(cfg, broker(&[("GANTRY_API_KEY", "k-123")]))
            .await
            .unwrap();
        assert_eq!(gateway.api_key(), Some("k-123"));
        assert!(!format!("{gateway:?}").contains("k-123"));
    }

    #[tokio::test]
    async fn test_status_lists_backends_with_route_counts() {
        let cfg = config(vec![
            ("github", http("http://localhost:9000", &["create_issue", "list_prs"])),
            ("search", http("http://localhost:9001", &["web_search"])),
        ]);
        let (gateway, report) = Gateway::start(cfg, broker(&[])).await.unwrap();
        assert!(report.all_ready());

        let status = gateway.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "github");
        assert_eq!(status[0].state, BackendState::Ready);
        assert_eq!(status[0].tools, 2);
        assert_eq!(status[1].tools, 1);

        let shutdown = gateway.shutdown().await;
        assert!(shutdown.is_clean());
        assert!(gateway
            .status()
            .await
            .iter()
            .all(|b| b.state == BackendState::Stopped));
    }

    #[tokio::test]
    async fn test_reload_swaps_backends() {
        let (gateway, _) = Gateway::start(
            config(vec![("github", http("http://localhost:9000", &["create_issue"]))]),
            broker(&[]),
        )
        .await
        .unwrap();
        let old = gateway.registry().snapshot().await;

        let report = gateway
            .reload(config(vec![("search", http("http://localhost:9001", &["web_search"]))]))
            .await
            .unwrap();
        assert!(report.all_ready());

        let current = gateway.registry().snapshot().await;
        assert_eq!(current.backend_names(), vec!["search"]);
        assert!(current.route("create_issue").is_none());
        assert_eq!(old.backend("github").unwrap().state(), BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_current_registry() {
        let (gateway, _) = Gateway::start(
            config(vec![("github", http("http://localhost:9000", &["create_issue"]))]),
            broker(&[]),
        )
        .await
        .unwrap();

        let bad = config(vec![("broken", BackendSpec::default())]);
        assert!(gateway.reload(bad).await.is_err());
        assert_eq!(gateway.registry().snapshot().await.backend_names(), vec!["github"]);
        assert_eq!(
            gateway.registry().snapshot().await.backend("github").unwrap().state(),
            BackendState::Ready
        );
    }
}
