/// Shared types, traits, and errors for the gantry MCP gateway.
///
/// This crate is the foundation that all other gantry crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) for pluggable health-check targets
/// - **Shared data types** (`model`): JSON-RPC messages, backend states, transport kinds
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`) and the file loader (`config_loader`)
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod model;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use config::{BackendSpec, GatewayConfig, GatewaySettings, TransportTarget};
pub use errors::{GatewayError, TransportFailure};
pub use model::*;
pub use traits::*;
