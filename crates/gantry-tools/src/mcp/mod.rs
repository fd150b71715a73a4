/// MCP transport adapters.
///
/// Every backend is reached through exactly one [`transport::Transport`]:
/// - stdio: local child process, newline-delimited JSON-RPC
/// - container: the same framing inside `<runtime> run -i --rm`
/// - HTTP: JSON-RPC POST with JSON or event-stream responses
///
/// The two process-backed variants share the id-correlated pipe layer in
/// `framed`.
mod framed;
pub mod tool_filter;
pub mod transport;
pub mod transport_container;
pub mod transport_http;
pub mod transport_stdio;
