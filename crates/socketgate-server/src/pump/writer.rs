//! Writer half of the pump.

use super::{CloseHandle, Closer, MessageSink};
use crate::relay::DeliveryReceiver;
use socketgate_core::GatewayResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Writes routed payloads from the delivery channel onto the wire.
pub struct MessageWriter<K> {
    sink: K,
    input: DeliveryReceiver,
    close: CloseHandle,
    peer: Option<Arc<dyn Closer>>,
}

impl<K: MessageSink> MessageWriter<K> {
    pub fn new(sink: K, input: DeliveryReceiver) -> Self {
        Self {
            sink,
            input,
            close: CloseHandle::new(),
            peer: None,
        }
    }

    /// Handle that stops this writer.
    pub fn closer(&self) -> CloseHandle {
        self.close.clone()
    }

    /// The worker to close when this writer exits.
    pub fn set_peer(&mut self, peer: Arc<dyn Closer>) {
        self.peer = Some(peer);
    }

    /// Pump until a write error, an explicit close, or until every sender of
    /// the delivery channel is gone. The sink is closed on the way out.
    pub async fn run(&mut self) -> GatewayResult<()> {
        let result = self.pump().await;
        self.close.close();
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "closing connection sink");
        }
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        result
    }

    async fn pump(&mut self) -> GatewayResult<()> {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.close.closed() => return Ok(()),
                payload = self.input.recv() => payload,
            };
            let Some(payload) = payload else {
                debug!("delivery channel closed");
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = self.close.closed() => return Ok(()),
                written = self.sink.write_message(&payload) => written?,
            }
        }
    }

    /// Stop writing and keep draining the delivery channel until `done`
    /// fires, so routed payloads never back up behind a dead connection.
    pub async fn discard_until(mut self, done: CancellationToken) {
        self.close.close();
        let mut discarded = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                payload = self.input.recv() => match payload {
                    Some(_) => discarded += 1,
                    None => break,
                },
            }
        }
        if discarded > 0 {
            debug!(discarded, "discarded payloads for closed connection");
        }
    }
}
