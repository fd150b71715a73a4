/// Configuration types for the gantry gateway.
///
/// A gateway config maps backend names to [`BackendSpec`]s plus a small
/// `gateway` section of process-wide settings. YAML is the native format;
/// JSON documents parse as well since JSON is a YAML subset.
///
/// ```yaml
/// gateway:
///   port: 8080
///   api_key: ${GANTRY_API_KEY}
///   request_timeout: 60s
/// mcpServers:
///   github:
///     url: http://localhost:9000
///     headers:
///       Authorization: Bearer ${GITHUB_TOKEN}
///     allowed: [create_issue, "list_*"]
///   search:
///     command: search-tool
///     args: ["--stdio"]
/// ```
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::model::TransportKind;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Backend name → spec. Names are unique by construction.
    #[serde(rename = "mcpServers", alias = "servers", default)]
    pub servers: BTreeMap<String, BackendSpec>,
}

/// Declarative description of one backend.
///
/// Exactly one of `command`, `container`, `url` selects the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Optional explicit transport; must agree with the selecting field.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<TransportKind>,
    /// Executable for stdio backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for the stdio executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Image for container backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Arguments appended after the image on container start.
    #[serde(default, alias = "entrypoint_args", skip_serializing_if = "Vec::is_empty")]
    pub entrypoint_args: Vec<String>,
    /// Endpoint for HTTP backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Environment for stdio/container processes. Values may use `${VAR}` templates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Static headers for HTTP backends. Values may use `${VAR}` templates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Tool allow filter: names or glob patterns, `*` for all. Absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    /// Tool names the backend is declared to serve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// A validated transport selection resolved from a [`BackendSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    Stdio {
        command: String,
        args: Vec<String>,
    },
    Container {
        image: String,
        entrypoint_args: Vec<String>,
    },
    Http {
        url: String,
    },
}

impl TransportTarget {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportTarget::Stdio { .. } => TransportKind::Stdio,
            TransportTarget::Container { .. } => TransportKind::Container,
            TransportTarget::Http { .. } => TransportKind::Http,
        }
    }
}

impl BackendSpec {
    /// Resolve which transport this spec selects.
    ///
    /// Fails unless exactly one of `command`, `container`, `url` is set, the
    /// selected field is non-empty, and an explicit `type` agrees with it.
    pub fn transport_target(&self, name: &str) -> Result<TransportTarget, GatewayError> {
        let mut selected = Vec::new();
        if self.command.is_some() {
            selected.push("command");
        }
        if self.container.is_some() {
            selected.push("container");
        }
        if self.url.is_some() {
            selected.push("url");
        }

        let target = match (selected.as_slice(), &self.command, &self.container, &self.url) {
            (["command"], Some(command), _, _) => TransportTarget::Stdio {
                command: non_empty(name, "command", command)?,
                args: self.args.clone(),
            },
            (["container"], _, Some(image), _) => TransportTarget::Container {
                image: non_empty(name, "container", image)?,
                entrypoint_args: self.entrypoint_args.clone(),
            },
            (["url"], _, _, Some(url)) => TransportTarget::Http {
                url: validate_url(name, url)?,
            },
            ([], ..) => {
                return Err(GatewayError::Config(format!(
                    "backend '{name}': one of 'command', 'container' or 'url' is required"
                )))
            }
            (fields, ..) => {
                return Err(GatewayError::Config(format!(
                    "backend '{name}': conflicting transport fields {}; exactly one is allowed",
                    fields.join(", ")
                )))
            }
        };

        if let Some(declared) = self.transport_type {
            if declared != target.kind() {
                return Err(GatewayError::Config(format!(
                    "backend '{name}': type '{declared}' does not match the configured {} transport",
                    target.kind()
                )));
            }
        }
        Ok(target)
    }

    /// True when the backend is reachable over HTTP.
    pub fn is_http(&self) -> bool {
        self.url.is_some() && self.command.is_none() && self.container.is_none()
    }

    /// Tool names this backend claims for routing.
    ///
    /// Declared `tools` plus literal (non-glob) names from the allow list.
    pub fn claimed_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.clone();
        if let Some(allowed) = &self.allowed {
            for entry in allowed {
                if !is_glob_pattern(entry) && !names.contains(entry) {
                    names.push(entry.clone());
                }
            }
        }
        names
    }

    /// Full structural validation of one backend.
    pub fn validate(&self, name: &str) -> Result<(), GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::Config(
                "backend names must not be empty".to_string(),
            ));
        }
        let target = self.transport_target(name)?;

        if let Some(allowed) = &self.allowed {
            if allowed.iter().any(|entry| entry.trim().is_empty()) {
                return Err(GatewayError::Config(format!(
                    "backend '{name}': 'allowed' entries must not be empty"
                )));
            }
        }
        if self.tools.iter().any(|tool| tool.trim().is_empty()) {
            return Err(GatewayError::Config(format!(
                "backend '{name}': 'tools' entries must not be empty"
            )));
        }

        for header in self.headers.keys() {
            if reqwest::header::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(GatewayError::Config(format!(
                    "backend '{name}': invalid header name '{header}'"
                )));
            }
        }
        if !self.headers.is_empty() && target.kind() != TransportKind::Http {
            tracing::warn!(
                backend = name,
                transport = %target.kind(),
                "headers are only sent to http backends and will be ignored"
            );
        }
        Ok(())
    }
}

/// True when a tool filter entry contains glob metacharacters.
pub fn is_glob_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '[', '{'])
}

fn non_empty(name: &str, field: &str, value: &str) -> Result<String, GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::Config(format!(
            "backend '{name}': '{field}' must not be empty"
        )));
    }
    Ok(value.to_string())
}

fn validate_url(name: &str, url: &str) -> Result<String, GatewayError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| {
        GatewayError::Config(format!("backend '{name}': invalid url '{url}': {e}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::Config(format!(
            "backend '{name}': url scheme must be http or https, got '{}'",
            parsed.scheme()
        )));
    }
    Ok(url.to_string())
}

/// Find the first tool name claimed by more than one backend.
///
/// Returns `(tool, first_backend, second_backend)` in name order.
pub fn find_tool_collision(
    servers: &BTreeMap<String, BackendSpec>,
) -> Option<(String, String, String)> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for (backend, spec) in servers {
        for tool in spec.claimed_tool_names() {
            if let Some(existing) = owners.get(&tool) {
                if *existing != backend.as_str() {
                    return Some((tool, existing.to_string(), backend.clone()));
                }
            } else {
                owners.insert(tool, backend.as_str());
            }
        }
    }
    None
}

// ============================================================
// Gateway settings
// ============================================================

/// Process-wide gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Port the agent-facing HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// API key agents must present. May use a `${VAR}` template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-request timeout for routed calls (e.g., "60s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    /// Bound on one backend's `start()` (e.g., "30s").
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: String,
    /// Grace period for stopping each backend on shutdown (e.g., "10s").
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
    /// Container runtime binary.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Startup verification options.
    #[serde(default)]
    pub health_check: HealthCheckSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
            request_timeout: default_request_timeout(),
            startup_timeout: default_startup_timeout(),
            shutdown_grace: default_shutdown_grace(),
            container_runtime: default_container_runtime(),
            health_check: HealthCheckSettings::default(),
        }
    }
}

/// Startup verification options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Also ping stdio/container backends over their framed channel.
    #[serde(default)]
    pub include_framed: bool,
}

/// Parsed duration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    pub request: Duration,
    pub startup: Duration,
    pub shutdown_grace: Duration,
}

impl GatewaySettings {
    /// Parse the duration strings.
    pub fn timeouts(&self) -> Result<GatewayTimeouts, GatewayError> {
        Ok(GatewayTimeouts {
            request: parse_duration(&self.request_timeout)?,
            startup: parse_duration(&self.startup_timeout)?,
            shutdown_grace: parse_duration(&self.shutdown_grace)?,
        })
    }
}

fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> String {
    "60s".to_string()
}
fn default_startup_timeout() -> String {
    "30s".to_string()
}
fn default_shutdown_grace() -> String {
    "10s".to_string()
}
fn default_container_runtime() -> String {
    "docker".to_string()
}

/// Parse a duration string like "500ms", "10s", "5m" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration, GatewayError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| GatewayError::Config(format!("duration '{s}' is missing a unit")))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| GatewayError::Config(format!("invalid duration value in '{s}'")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(GatewayError::Config(format!(
            "unknown duration unit '{other}' in '{s}'"
        ))),
    }
}
