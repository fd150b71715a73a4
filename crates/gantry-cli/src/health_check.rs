//! `gantry health-check`: ping every HTTP backend through a running gateway.
//!
//! Each backend is pinged at `<gateway-url>/mcp/<backend>` on the standard
//! retry schedule. The gateway reports transport failures with a JSON-RPC
//! error whose `data.kind` names the failure, which is mapped back onto
//! [`TransportFailure`] so the summary can suggest causes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;

use gantry_core::{HealthChecker, HealthReport};
use gantry_tools::mcp::transport_http::classify_request_error;
use gantry_types::config::GatewayConfig;
use gantry_types::config_loader::ConfigLoader;
use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::{JsonRpcMessage, TransportKind};
use gantry_types::traits::PingTarget;

use crate::cli::HealthCheckArgs;

/// Pings one backend through the gateway's passthrough route.
#[derive(Debug, Clone)]
pub struct GatewayPingTarget {
    client: reqwest::Client,
    backend: String,
    kind: TransportKind,
    endpoint: String,
    api_key: Option<String>,
}

impl GatewayPingTarget {
    pub fn new(
        client: reqwest::Client,
        gateway_url: &str,
        backend: impl Into<String>,
        kind: TransportKind,
        api_key: Option<String>,
    ) -> Self {
        let backend = backend.into();
        let endpoint = format!("{}/mcp/{backend}", gateway_url.trim_end_matches('/'));
        Self {
            client,
            backend,
            kind,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl PingTarget for GatewayPingTarget {
    fn name(&self) -> &str {
        &self.backend
    }

    fn skip_reason(&self) -> Option<String> {
        (self.kind != TransportKind::Http)
            .then(|| format!("no HTTP endpoint ({} transport)", self.kind))
    }

    async fn ping(&self, timeout: Duration) -> Result<JsonRpcMessage, TransportFailure> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&JsonRpcMessage::request(1, "ping", None));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| TransportFailure::Io("API key is not a valid header value".to_string()))?;
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await.map_err(|e| classify_request_error(&e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| classify_request_error(&e))?;
        let message = serde_json::from_slice::<JsonRpcMessage>(&body).ok();

        if status.is_success() {
            return message.ok_or_else(|| {
                TransportFailure::Protocol("gateway returned a non JSON-RPC body".to_string())
            });
        }
        Err(failure_from_gateway(status, message.as_ref()))
    }
}

/// Recover the backend's failure from a gateway error response.
fn failure_from_gateway(status: StatusCode, message: Option<&JsonRpcMessage>) -> TransportFailure {
    message
        .and_then(|m| m.error.as_ref())
        .and_then(|e| e.data.as_ref())
        .and_then(TransportFailure::from_data)
        .unwrap_or(TransportFailure::Http {
            status: status.as_u16(),
        })
}

/// One ping target per configured backend, in name order.
///
/// Fails if a backend does not select exactly one transport.
pub fn targets(
    config: &GatewayConfig,
    gateway_url: &str,
    api_key: Option<&str>,
) -> Result<Vec<Arc<dyn PingTarget>>, GatewayError> {
    let client = reqwest::Client::new();
    config
        .servers
        .iter()
        .map(|(name, spec)| {
            let kind = spec.transport_target(name)?.kind();
            Ok(Arc::new(GatewayPingTarget::new(
                client.clone(),
                gateway_url,
                name.as_str(),
                kind,
                api_key.map(String::from),
            )) as Arc<dyn PingTarget>)
        })
        .collect()
}

/// Check every backend with `checker`.
pub async fn check(
    config: &GatewayConfig,
    gateway_url: &str,
    api_key: Option<&str>,
    checker: &HealthChecker,
) -> Result<HealthReport, GatewayError> {
    let targets = targets(config, gateway_url, api_key)?;
    tracing::info!(
        gateway = %gateway_url,
        backends = config.servers.len(),
        "running health check"
    );
    Ok(checker.check_all(targets).await)
}

/// Run the command and return the process exit code.
pub async fn run(args: HealthCheckArgs) -> Result<i32, GatewayError> {
    let config = ConfigLoader::load_file(&args.config)?;
    ConfigLoader::validate(&config)?;

    let report = check(
        &config,
        &args.gateway_url,
        args.api_key.as_deref(),
        &HealthChecker::default(),
    )
    .await?;
    print!("{}", report.render());
    Ok(report.exit_code())
}
