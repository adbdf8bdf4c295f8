//! Connection registry and the direct send operation built on it.

pub mod registry;
pub mod sender;

pub use registry::{DeliveryReceiver, OutboundEnvelope, Registry};
pub use sender::{SendRequest, Sender};
