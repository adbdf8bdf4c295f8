//! Wire transports for client connections.

pub mod websocket;
