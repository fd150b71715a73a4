/// Gateway core for gantry.
///
/// - **Lifecycle**: start every configured backend concurrently, stop them with a grace period
/// - **Discovery**: MCP handshake and `tools/list` against each backend
/// - **Router**: resolve a tool name to its backend and forward the call
/// - **Health**: ping backends on a widening retry schedule and summarize the verdict
/// - **Server**: the agent-facing HTTP endpoint
pub mod discovery;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod router;
pub mod server;

pub use gateway::{build_registry, BackendStatusView, Gateway};
pub use health::{HealthChecker, HealthReport, RetrySchedule, Verdict};
pub use lifecycle::{LifecycleManager, ShutdownReport, StartupReport};
pub use router::{RequestRouter, RoutedResponse};
