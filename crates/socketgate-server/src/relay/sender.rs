//! Direct send: validate a payload and route it to one connection.

use super::registry::{OutboundEnvelope, Registry};
use socketgate_core::{ConnectionId, Context, GatewayError, GatewayResult};
use tracing::trace;

/// Request to push `data` to the connection `connection_id`.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub connection_id: ConnectionId,
    pub data: Vec<u8>,
}

/// Pushes payloads into the registry on behalf of backend callers.
#[derive(Clone)]
pub struct Sender {
    registry: Registry,
}

impl Sender {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Route `req` unless it is empty or `ctx` is cancelled first.
    pub async fn send_message(&self, ctx: &Context, req: SendRequest) -> GatewayResult<()> {
        if req.data.is_empty() {
            return Err(GatewayError::InvalidMessage("empty message".into()));
        }

        let envelope = OutboundEnvelope::new(req.connection_id, req.data);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Cancelled),
            routed = self.registry.route(envelope) => routed?,
        }
        trace!(conn_id = %req.connection_id, "message sent");
        Ok(())
    }
}
