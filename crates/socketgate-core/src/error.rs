use crate::response::ErrorResponse;
use thiserror::Error;

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("generating connection id: {0}")]
    IdGeneration(String),

    #[error("invalid connection id: {0}")]
    InvalidId(String),

    #[error("registry closed")]
    RegistryClosed,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rpc {call} failed: {reason}")]
    Rpc { call: &'static str, reason: String },

    #[error("context canceled")]
    Cancelled,

    #[error("panic: {0}")]
    Panic(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Response(#[from] ErrorResponse),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Build an [`GatewayError::Rpc`] for the named remote call.
    pub fn rpc(call: &'static str, reason: impl ToString) -> Self {
        GatewayError::Rpc {
            call,
            reason: reason.to_string(),
        }
    }

    /// The payload a client sees for this error.
    ///
    /// Typed responses pass through unchanged; everything else collapses
    /// into a generic internal error without internal detail.
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            GatewayError::Response(er) => er.clone(),
            _ => ErrorResponse::internal_server_error("server_error", "", None),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
