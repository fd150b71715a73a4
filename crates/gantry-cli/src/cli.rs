//! CLI argument types for `gantry serve` and `gantry health-check`.
//!
//! Kept apart from `main.rs` so tests can parse them directly.

use std::path::PathBuf;

use clap::Args;

/// Arguments for `gantry serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Gateway config file (YAML or JSON).
    #[arg(long, short, env = "GANTRY_CONFIG", default_value = "gantry.yaml")]
    pub config: PathBuf,

    /// Override the port from the config file.
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Bind address for the agent-facing server.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Skip the startup health check.
    #[arg(long)]
    pub no_verify: bool,

    /// Enable debug logging.
    #[arg(long, short)]
    pub verbose: bool,
}

/// Arguments for `gantry health-check`.
#[derive(Args, Debug)]
pub struct HealthCheckArgs {
    /// Gateway config file listing the backends to check.
    #[arg(long, short, env = "GANTRY_CONFIG", default_value = "gantry.yaml")]
    pub config: PathBuf,

    /// Base URL of the running gateway.
    #[arg(long, env = "GANTRY_GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    pub gateway_url: String,

    /// API key sent in `Authorization` to the gateway.
    #[arg(long, env = "GANTRY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Enable debug logging.
    #[arg(long, short)]
    pub verbose: bool,
}
