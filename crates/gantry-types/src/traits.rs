/// Trait contracts shared across gantry crates.
///
/// The health checker codes against [`PingTarget`] rather than against the
/// concrete transports, so the retry schedule can be driven by fakes in tests
/// and by the CLI's gateway-routed pings in production.
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::TransportFailure;
use crate::model::JsonRpcMessage;

/// Something the health checker can send a `ping` to.
#[async_trait]
pub trait PingTarget: Send + Sync {
    /// Backend name the target reports under.
    fn name(&self) -> &str;

    /// Why this target is not checkable, if it is not.
    ///
    /// Skipped targets count toward the `skipped` total and are never pinged.
    fn skip_reason(&self) -> Option<String> {
        None
    }

    /// Send one `ping` request and wait at most `timeout` for the parsed response.
    ///
    /// A response carrying a JSON-RPC `error` is returned as `Ok`; the caller
    /// decides how to classify it.
    async fn ping(&self, timeout: Duration) -> Result<JsonRpcMessage, TransportFailure>;
}
