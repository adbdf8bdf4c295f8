//! socketgate-core: shared library for the socket gateway.
//!
//! Provides connection identifiers, the error taxonomy and structured error
//! payloads, the statistics interface, and the request pipeline (services
//! wrapped in ordered filters) used by every inbound and outbound call.

pub mod error;
pub mod id;
pub mod pipeline;
pub mod response;
pub mod stats;

// Re-export commonly used items at crate root.
pub use error::{GatewayError, GatewayResult};
pub use id::ConnectionId;
pub use pipeline::{apply, chain, service_fn, Context, Filter, Service};
pub use response::ErrorResponse;
pub use stats::{StatsReceiver, StatsRecorder};
