//! Per-connection message pump.
//!
//! A [`MessageReader`] moves whole messages from the wire into a channel and
//! a [`MessageWriter`] moves routed payloads from the delivery channel onto
//! the wire. Each holds the other's [`CloseHandle`] and closes it exactly
//! once on exit, so an I/O fault on one side always tears down both.

pub mod reader;
pub mod writer;

pub use reader::MessageReader;
pub use writer::MessageWriter;

use socketgate_core::GatewayResult;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Incoming half of a connection, one whole message at a time.
pub trait MessageSource: Send {
    /// Next message, or `None` at end of stream.
    fn read_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>>;
}

/// Outgoing half of a connection.
pub trait MessageSink: Send {
    /// Write one whole binary message.
    fn write_message<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + 'a>>;

    /// Close the connection's outgoing side.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>>;
}

impl<T: MessageSource + ?Sized> MessageSource for Box<T> {
    fn read_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>> {
        (**self).read_message()
    }
}

impl<T: MessageSink + ?Sized> MessageSink for Box<T> {
    fn write_message<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + 'a>> {
        (**self).write_message(payload)
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        (**self).close()
    }
}

/// Something a pump worker can ask to stop.
pub trait Closer: Send + Sync {
    /// Request a stop. Idempotent.
    fn close(&self);
}

/// Stop request for one pump worker.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }
}

impl Closer for CloseHandle {
    fn close(&self) {
        self.0.cancel();
    }
}
