//! Connection lifecycle.
//!
//! A [`Session`] owns one client connection and walks it through
//! authentication, registration, presence announcement and message relay
//! until it terminates. Every exit path goes through
//! [`ConnectionState::Terminated`], which releases what the earlier states
//! acquired.

pub mod states;

pub use states::ConnectionState;

use crate::auth::{Authenticator, HandshakeRequest};
use crate::pump::{MessageSink, MessageSource, MessageWriter};
use crate::relay::Registry;
use crate::rpc::{BrokerClient, PresenceClient};
use socketgate_core::{ConnectionId, Filter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collaborators shared by every session.
pub struct SessionServices {
    pub registry: Registry,
    pub authenticator: Arc<dyn Authenticator>,
    pub presence: Arc<dyn PresenceClient>,
    pub broker: Arc<dyn BrokerClient>,
    /// Filters wrapped around every presence and broker call.
    pub outbound: Arc<dyn Filter>,
    /// Capacity of each connection's delivery channel, at least 1.
    pub delivery_capacity: usize,
    /// Fired on process shutdown.
    pub shutdown: CancellationToken,
}

/// One client connection and what its lifecycle has acquired so far.
pub struct Session<S, K> {
    services: Arc<SessionServices>,
    handshake: HandshakeRequest,
    source: Option<S>,
    sink: Option<K>,
    writer: Option<MessageWriter<K>>,
    identity: Option<String>,
    id: Option<ConnectionId>,
    presence_announced: bool,
    done: CancellationToken,
}

impl<S, K> Session<S, K>
where
    S: MessageSource + 'static,
    K: MessageSink + 'static,
{
    pub fn new(services: Arc<SessionServices>, handshake: HandshakeRequest, source: S, sink: K) -> Self {
        Self {
            services,
            handshake,
            source: Some(source),
            sink: Some(sink),
            writer: None,
            identity: None,
            id: None,
            presence_announced: false,
            done: CancellationToken::new(),
        }
    }

    /// Fires once the session has fully terminated.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Drive the lifecycle to completion.
    pub async fn run(mut self) {
        let mut state = Some(ConnectionState::Unauthenticated);
        while let Some(current) = state {
            debug!(state = %current, "connection state");
            state = self.step(current).await;
        }
    }
}
