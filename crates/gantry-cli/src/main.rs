//! gantry CLI entry point.
//!
//! Dispatches to `serve` (run the gateway) or `health-check` (verify the
//! backends of a running gateway).

use clap::{Parser, Subcommand};

use gantry_cli::cli::{HealthCheckArgs, ServeArgs};
use gantry_cli::{health_check, serve};

/// gantry: one MCP endpoint in front of many tool servers.
#[derive(Parser)]
#[command(name = "gantry", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backends and serve agents.
    Serve(ServeArgs),
    /// Ping every HTTP backend through a running gateway.
    HealthCheck(HealthCheckArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.verbose, "info");
            report("serve", serve::run(args).await)
        }
        Commands::HealthCheck(args) => {
            init_tracing(args.verbose, "warn");
            report("health-check", health_check::run(args).await)
        }
    };

    std::process::exit(code);
}

fn report(command: &str, result: Result<i32, gantry_types::errors::GatewayError>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "{command} failed");
            eprintln!("gantry {command}: {e}");
            1
        }
    }
}

/// Log to stderr. `--verbose` forces `debug`; otherwise `RUST_LOG` applies,
/// falling back to `default_level`.
fn init_tracing(verbose: bool, default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
