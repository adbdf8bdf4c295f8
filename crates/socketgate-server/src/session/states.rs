//! Connection states and the work done in each.

use super::{Session, SessionServices};
use crate::pump::{Closer, MessageReader, MessageSink, MessageSource, MessageWriter};
use crate::rpc::Status;
use socketgate_core::{service_fn, ConnectionId, Context, GatewayResult};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where a connection is in its lifecycle. Each state names the step that
/// runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Registered,
    PresenceAnnounced,
    Relaying,
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Registered => "registered",
            ConnectionState::PresenceAnnounced => "presence_announced",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

impl<S, K> Session<S, K>
where
    S: MessageSource + 'static,
    K: MessageSink + 'static,
{
    /// Run one state. `None` ends the lifecycle.
    pub(super) async fn step(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        match state {
            ConnectionState::Unauthenticated => Some(self.authenticate().await),
            ConnectionState::Registered => Some(self.register().await),
            ConnectionState::PresenceAnnounced => Some(self.announce().await),
            ConnectionState::Relaying => Some(self.relay().await),
            ConnectionState::Terminated => {
                self.terminate().await;
                None
            }
        }
    }

    async fn authenticate(&mut self) -> ConnectionState {
        match self.services.authenticator.authenticate(&self.handshake).await {
            Ok(identity) => {
                debug!(identity = %identity, "authenticated");
                self.identity = Some(identity);
                ConnectionState::Registered
            }
            Err(e) => {
                info!(error = %e, "rejecting unauthenticated connection");
                ConnectionState::Terminated
            }
        }
    }

    async fn register(&mut self) -> ConnectionState {
        let Some(sink) = self.sink.take() else {
            return ConnectionState::Terminated;
        };
        let (tx, rx) = mpsc::channel(self.services.delivery_capacity.max(1));
        self.writer = Some(MessageWriter::new(sink, rx));

        match self.services.registry.register(tx).await {
            Ok(id) => {
                self.id = Some(id);
                ConnectionState::PresenceAnnounced
            }
            Err(e) => {
                error!(error = %e, "could not register connection");
                ConnectionState::Terminated
            }
        }
    }

    async fn announce(&mut self) -> ConnectionState {
        let (Some(id), Some(identity)) = (self.id, self.identity.clone()) else {
            return ConnectionState::Terminated;
        };
        let ctx = Context::with_token(self.services.shutdown.child_token());
        match set_presence(&self.services, ctx, id, identity, Status::Online).await {
            Ok(()) => {
                self.presence_announced = true;
                ConnectionState::Relaying
            }
            Err(e) => {
                error!(conn_id = %id, error = %e, "could not announce presence");
                ConnectionState::Terminated
            }
        }
    }

    async fn relay(&mut self) -> ConnectionState {
        let (Some(id), Some(source), Some(mut writer)) =
            (self.id, self.source.take(), self.writer.take())
        else {
            return ConnectionState::Terminated;
        };

        let (mut reader, mut inbound) = MessageReader::new(source);
        reader.set_peer(Arc::new(writer.closer()));
        writer.set_peer(Arc::new(reader.closer()));
        let stop_reader = reader.closer();

        let writer_task = tokio::spawn(async move {
            let result = writer.run().await;
            (writer, result)
        });
        let reader_task = tokio::spawn(reader.run());

        info!(conn_id = %id, "relaying");
        let ctx = Context::with_token(self.services.shutdown.child_token());
        loop {
            let message = tokio::select! {
                _ = self.services.shutdown.cancelled() => {
                    debug!(conn_id = %id, "shutting down connection");
                    stop_reader.close();
                    break;
                }
                message = inbound.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(e) = forward(&self.services, ctx.clone(), message).await {
                warn!(conn_id = %id, error = %e, "could not forward message to broker");
            }
        }

        match reader_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = %id, error = %e, "reader stopped"),
            Err(e) => error!(conn_id = %id, error = %e, "reader task failed"),
        }
        match writer_task.await {
            Ok((writer, result)) => {
                if let Err(e) = result {
                    debug!(conn_id = %id, error = %e, "writer stopped");
                }
                self.writer = Some(writer);
            }
            Err(e) => error!(conn_id = %id, error = %e, "writer task failed"),
        }
        ConnectionState::Terminated
    }

    async fn terminate(&mut self) {
        if self.presence_announced {
            if let (Some(id), Some(identity)) = (self.id, self.identity.clone()) {
                // Shutdown may already have fired, so this call gets its own scope.
                let ctx = Context::background();
                if let Err(e) = set_presence(&self.services, ctx, id, identity, Status::Offline).await {
                    warn!(conn_id = %id, error = %e, "could not clear presence");
                }
            }
        }

        if let Some(id) = self.id.take() {
            if let Some(writer) = self.writer.take() {
                tokio::spawn(writer.discard_until(self.done.clone()));
            }
            self.services.registry.unregister(id).await;
            info!(conn_id = %id, "connection closed");
        }
        self.done.cancel();
    }
}

/// Report `status` through the outbound filters.
async fn set_presence(
    services: &SessionServices,
    ctx: Context,
    id: ConnectionId,
    identity: String,
    status: Status,
) -> GatewayResult<()> {
    let presence = services.presence.clone();
    let service = service_fn("presence.set_status", move |ctx: Context| {
        let presence = presence.clone();
        let identity = identity.clone();
        async move { presence.set_status(&ctx, id, &identity, status).await }
    });
    services.outbound.call(ctx, &service).await
}

/// Hand one client message to the broker through the outbound filters.
async fn forward(services: &SessionServices, ctx: Context, message: Vec<u8>) -> GatewayResult<()> {
    let broker = services.broker.clone();
    let service = service_fn("broker.route", move |ctx: Context| {
        let broker = broker.clone();
        let payload = message.clone();
        async move { broker.route(&ctx, payload).await }
    });
    services.outbound.call(ctx, &service).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Unauthenticated.to_string(), "unauthenticated");
        assert_eq!(ConnectionState::PresenceAnnounced.to_string(), "presence_announced");
        assert_eq!(ConnectionState::Terminated.to_string(), "terminated");
    }
}
