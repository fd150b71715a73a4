//! `gantry serve`: start every backend, serve agents, apply config reloads,
//! and stop the backends on SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use gantry_core::lifecycle::StartupReport;
use gantry_core::server;
use gantry_core::{Gateway, HealthChecker};
use gantry_security::SecretBroker;
use gantry_types::config::GatewayConfig;
use gantry_types::config_loader::ConfigLoader;
use gantry_types::errors::GatewayError;
use gantry_types::model::BackendState;

use crate::cli::ServeArgs;

/// Run the gateway until a shutdown signal arrives. Returns the exit code.
pub async fn run(args: ServeArgs) -> Result<i32, GatewayError> {
    let (mut loader, mut updates) = ConfigLoader::load(&args.config)?;
    let config = updates.borrow_and_update().clone();
    let port = args.port.unwrap_or(config.gateway.port);

    let checker = HealthChecker::default();
    let verify = (!args.no_verify).then_some(&checker);
    let gateway = Arc::new(bring_up(config, SecretBroker::from_env()?, verify).await?);

    if let Err(e) = loader.watch() {
        tracing::warn!(error = %e, "hot reload disabled");
    }
    let reloads = tokio::spawn(apply_reloads(gateway.clone(), updates));

    let listener = match TcpListener::bind((args.host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            reloads.abort();
            gateway.shutdown().await;
            return Err(GatewayError::Io(format!("failed to bind {}:{port}: {e}", args.host)));
        }
    };
    let served = server::serve(listener, gateway.clone(), shutdown_signal()).await;

    reloads.abort();
    let report = gateway.shutdown().await;
    if report.is_clean() {
        tracing::info!("all backends stopped");
    } else {
        for forced in report.forced() {
            tracing::warn!(backend = %forced.backend, "backend was killed after the grace period");
        }
    }
    served.map(|()| 0)
}

/// Start every backend, build the initial route table and, with a `checker`,
/// verify the backends. Nothing is served until this returns.
///
/// A tool-name collision in the initial route table stops the backends and is
/// returned as a configuration error.
pub async fn bring_up(
    config: GatewayConfig,
    broker: SecretBroker,
    checker: Option<&HealthChecker>,
) -> Result<Gateway, GatewayError> {
    let (gateway, startup) = Gateway::start(config, broker).await?;
    log_startup(&startup);

    match gateway.refresh_routes().await {
        Ok(table) => tracing::debug!(routes = ?table, "route table"),
        Err(e) => {
            tracing::error!(error = %e, "initial tool discovery failed; stopping backends");
            gateway.shutdown().await;
            return Err(e);
        }
    }

    if let Some(checker) = checker {
        let report = gateway.verify(checker).await;
        for line in report.render().lines().filter(|l| !l.is_empty()) {
            tracing::info!("{line}");
        }
        if report.exit_code() != 0 {
            tracing::warn!(verdict = ?report.verdict(), "startup verification found unhealthy backends");
        }
    }
    Ok(gateway)
}

async fn apply_reloads(gateway: Arc<Gateway>, mut updates: watch::Receiver<GatewayConfig>) {
    while updates.changed().await.is_ok() {
        let config = updates.borrow_and_update().clone();
        match gateway.reload(config).await {
            Ok(report) => {
                log_startup(&report);
                refresh(&gateway).await;
            }
            Err(e) => tracing::error!(error = %e, "reload rejected; keeping current backends"),
        }
    }
}

async fn refresh(gateway: &Gateway) {
    match gateway.refresh_routes().await {
        Ok(table) => tracing::debug!(routes = ?table, "route table"),
        Err(e) => tracing::warn!(error = %e, "route refresh rejected; keeping current routes"),
    }
}

fn log_startup(report: &StartupReport) {
    for backend in &report.backends {
        match backend.state {
            BackendState::Ready => tracing::info!(
                backend = %backend.backend,
                transport = %backend.kind,
                elapsed_ms = backend.elapsed.as_millis() as u64,
                "backend ready"
            ),
            _ => tracing::error!(
                backend = %backend.backend,
                transport = %backend.kind,
                error = backend.error.as_deref().unwrap_or("unknown"),
                "backend failed to start"
            ),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
