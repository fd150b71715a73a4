/// Backend-facing subsystem of the gantry gateway.
///
/// - **MCP transports**: one adapter per backend over stdio, container or HTTP
/// - **Tool filter**: per-backend allow lists
/// - **Registry**: backend instances and the tool route table
pub mod mcp;
pub mod registry;

pub use mcp::tool_filter::ToolFilter;
pub use mcp::transport::{StopOutcome, Transport, TransportOptions};
pub use registry::{
    BackendInstance, RegistryBuilder, RegistrySnapshot, ServerRegistry, ToolRoute, BACKEND_CRASHED,
};
