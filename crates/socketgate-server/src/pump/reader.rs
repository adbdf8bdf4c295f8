//! Reader half of the pump.

use super::{CloseHandle, Closer, MessageSource};
use socketgate_core::GatewayResult;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Reads whole messages from the wire and offers them on its read channel.
pub struct MessageReader<S> {
    source: S,
    out: mpsc::Sender<Vec<u8>>,
    close: CloseHandle,
    peer: Option<Arc<dyn Closer>>,
}

impl<S: MessageSource> MessageReader<S> {
    /// Wrap `source`. The returned receiver yields messages in wire order.
    pub fn new(source: S) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (out, rx) = mpsc::channel(1);
        let reader = Self {
            source,
            out,
            close: CloseHandle::new(),
            peer: None,
        };
        (reader, rx)
    }

    /// Handle that stops this reader.
    pub fn closer(&self) -> CloseHandle {
        self.close.clone()
    }

    /// The worker to close when this reader exits.
    pub fn set_peer(&mut self, peer: Arc<dyn Closer>) {
        self.peer = Some(peer);
    }

    /// Pump until end of stream, a read error, or an explicit close.
    ///
    /// An explicit close or a dropped read channel is a clean stop.
    pub async fn run(mut self) -> GatewayResult<()> {
        let result = self.pump().await;
        self.close.close();
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        result
    }

    async fn pump(&mut self) -> GatewayResult<()> {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.close.closed() => return Ok(()),
                read = self.source.read_message() => read,
            };
            let Some(message) = read? else {
                debug!("connection reached end of stream");
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = self.close.closed() => return Ok(()),
                sent = self.out.send(message) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::testing::{scripted_source, CountingCloser};
    use socketgate_core::GatewayError;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn forwards_messages_in_order() {
        let (source, script) = scripted_source();
        let (mut reader, mut rx) = MessageReader::new(source);
        let peer = Arc::new(CountingCloser::default());
        reader.set_peer(peer.clone());
        let task = tokio::spawn(reader.run());

        script.send(Ok(Some(b"one".to_vec()))).unwrap();
        script.send(Ok(Some(b"two".to_vec()))).unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");

        script.send(Ok(None)).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, None);
        assert_eq!(peer.count(), 1);
    }

    #[tokio::test]
    async fn read_error_stops_and_closes_peer() {
        let (source, script) = scripted_source();
        let (mut reader, _rx) = MessageReader::new(source);
        let peer = Arc::new(CountingCloser::default());
        reader.set_peer(peer.clone());
        let closer = reader.closer();

        script
            .send(Err(GatewayError::Transport("reset".into())))
            .unwrap();
        let result = reader.run().await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert_eq!(peer.count(), 1);
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn explicit_close_stops_blocked_read() {
        let (source, _script) = scripted_source();
        let (mut reader, _rx) = MessageReader::new(source);
        let peer = Arc::new(CountingCloser::default());
        reader.set_peer(peer.clone());
        let closer = reader.closer();
        let task = tokio::spawn(reader.run());

        closer.close();
        closer.close();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("reader stops after close")
            .unwrap()
            .unwrap();
        assert_eq!(peer.count(), 1);
    }

    #[tokio::test]
    async fn close_while_nobody_reads_the_channel() {
        let (source, script) = scripted_source();
        let (reader, _rx) = MessageReader::new(source);
        let closer = reader.closer();
        let task = tokio::spawn(reader.run());

        // Capacity is 1, so the second message blocks the reader.
        script.send(Ok(Some(b"a".to_vec()))).unwrap();
        script.send(Ok(Some(b"b".to_vec()))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        closer.close();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("reader stops while blocked on send")
            .unwrap()
            .unwrap();
    }
}
