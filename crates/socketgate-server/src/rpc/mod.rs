//! Clients for the backend services a connection talks to.
//!
//! Both are opaque request/response calls that may fail or time out. The
//! lifecycle wraps every call in the outbound filter chain.

pub mod broker;
pub mod presence;

pub use broker::{BrokerClient, HttpBrokerClient};
pub use presence::{HttpPresenceClient, PresenceClient, Status};

use socketgate_core::{Context, GatewayError, GatewayResult};
use std::future::Future;

/// Race `call` against cancellation of `ctx`.
pub(crate) async fn until_cancelled<T>(
    ctx: &Context,
    call: impl Future<Output = GatewayResult<T>>,
) -> GatewayResult<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(GatewayError::Cancelled),
        result = call => result,
    }
}
