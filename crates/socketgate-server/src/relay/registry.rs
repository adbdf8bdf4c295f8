//! Connection registry.
//!
//! Maps connection ids to per-connection delivery channels. The table is
//! owned by a single [`RegistryLoop`] task; every [`Registry`] handle talks
//! to it through request channels, so no lock guards the table.

use socketgate_core::{ConnectionId, GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sending half of a connection's delivery channel.
pub type DeliverySender = mpsc::Sender<Vec<u8>>;

/// Receiving half of a connection's delivery channel.
pub type DeliveryReceiver = mpsc::Receiver<Vec<u8>>;

/// Produces connection ids. Swappable so tests can pin ids.
pub type IdGenerator = Arc<dyn Fn() -> GatewayResult<ConnectionId> + Send + Sync>;

/// Capacity of each request channel into the loop.
const REQUEST_CAPACITY: usize = 64;

/// A payload addressed to one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: ConnectionId,
    pub payload: Vec<u8>,
}

impl OutboundEnvelope {
    pub fn new(destination: ConnectionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination,
            payload: payload.into(),
        }
    }
}

struct RegisterRequest {
    id: ConnectionId,
    sender: DeliverySender,
    ack: oneshot::Sender<()>,
}

struct UnregisterRequest {
    id: ConnectionId,
    ack: oneshot::Sender<()>,
}

/// Cloneable handle to the registry.
#[derive(Clone)]
pub struct Registry {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    route_tx: mpsc::Sender<OutboundEnvelope>,
    len_tx: mpsc::Sender<oneshot::Sender<usize>>,
    done: CancellationToken,
    generate_id: IdGenerator,
}

/// The task that owns the routing table. Drive it with [`RegistryLoop::run`].
pub struct RegistryLoop {
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<UnregisterRequest>,
    route_rx: mpsc::Receiver<OutboundEnvelope>,
    len_rx: mpsc::Receiver<oneshot::Sender<usize>>,
    done: CancellationToken,
    table: HashMap<ConnectionId, DeliverySender>,
}

impl Registry {
    /// Create a registry that draws ids from the OS random source.
    pub fn new() -> (Registry, RegistryLoop) {
        Self::with_id_generator(Arc::new(ConnectionId::generate))
    }

    pub fn with_id_generator(generate_id: IdGenerator) -> (Registry, RegistryLoop) {
        let (register_tx, register_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (route_tx, route_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (len_tx, len_rx) = mpsc::channel(REQUEST_CAPACITY);
        let done = CancellationToken::new();

        let handle = Registry {
            register_tx,
            unregister_tx,
            route_tx,
            len_tx,
            done: done.clone(),
            generate_id,
        };
        let event_loop = RegistryLoop {
            register_rx,
            unregister_rx,
            route_rx,
            len_rx,
            done,
            table: HashMap::new(),
        };
        (handle, event_loop)
    }

    /// Install `sender` under a fresh id.
    ///
    /// Returns once the loop has installed the mapping, so a `route` issued
    /// afterwards always finds it.
    pub async fn register(&self, sender: DeliverySender) -> GatewayResult<ConnectionId> {
        let id = (self.generate_id)()?;
        let (ack, acked) = oneshot::channel();
        self.submit(&self.register_tx, RegisterRequest { id, sender, ack })
            .await?;
        acked.await.map_err(|_| GatewayError::RegistryClosed)?;
        Ok(id)
    }

    /// Remove `id` if present. Idempotent, and a no-op once the registry is
    /// closed. Returns once nothing can be delivered to `id` any more.
    pub async fn unregister(&self, id: ConnectionId) {
        let (ack, acked) = oneshot::channel();
        if self
            .submit(&self.unregister_tx, UnregisterRequest { id, ack })
            .await
            .is_ok()
        {
            let _ = acked.await;
        }
    }

    /// Hand `envelope` to the loop. Delivery is best effort: unknown ids and
    /// full channels drop the payload. Only a closed registry is an error.
    pub async fn route(&self, envelope: OutboundEnvelope) -> GatewayResult<()> {
        self.submit(&self.route_tx, envelope).await
    }

    /// Number of connections currently in the table.
    pub async fn len(&self) -> GatewayResult<usize> {
        let (reply, answer) = oneshot::channel();
        self.submit(&self.len_tx, reply).await?;
        answer.await.map_err(|_| GatewayError::RegistryClosed)
    }

    /// Stop the loop. Idempotent. Outstanding delivery channels stay open.
    pub fn close(&self) {
        self.done.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    async fn submit<T>(&self, tx: &mpsc::Sender<T>, request: T) -> GatewayResult<()> {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(GatewayError::RegistryClosed),
            sent = tx.send(request) => sent.map_err(|_| GatewayError::RegistryClosed),
        }
    }
}

impl RegistryLoop {
    /// Serve requests until the registry is closed or every handle is gone.
    ///
    /// All request senders live in the same handle, so one closed request
    /// channel means every handle has been dropped.
    pub async fn run(mut self) {
        debug!("registry loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                req = self.register_rx.recv() => {
                    let Some(req) = req else { break };
                    self.table.insert(req.id, req.sender);
                    info!(conn_id = %req.id, connections = self.table.len(), "connection registered");
                    let _ = req.ack.send(());
                }
                req = self.unregister_rx.recv() => {
                    let Some(req) = req else { break };
                    if self.table.remove(&req.id).is_some() {
                        info!(conn_id = %req.id, connections = self.table.len(), "connection unregistered");
                    }
                    let _ = req.ack.send(());
                }
                envelope = self.route_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.deliver(envelope);
                }
                reply = self.len_rx.recv() => {
                    let Some(reply) = reply else { break };
                    let _ = reply.send(self.table.len());
                }
            }
        }
        // Make every handle see the closed state, including after the last
        // handle was dropped.
        self.done.cancel();
        debug!(connections = self.table.len(), "registry loop stopped");
    }

    fn deliver(&mut self, envelope: OutboundEnvelope) {
        let OutboundEnvelope {
            destination,
            payload,
        } = envelope;
        let Some(sender) = self.table.get(&destination) else {
            warn!(conn_id = %destination, "dropping message for unknown connection");
            return;
        };
        match sender.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %destination, "delivery channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(conn_id = %destination, "delivery channel closed, dropping message");
            }
        }
    }
}
