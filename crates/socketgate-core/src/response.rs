//! Structured error payloads for the control-plane HTTP boundary.
//!
//! Wire shape: `{"status": 400, "error": "invalid_request", "message": "..."}`.
//! `status` and `error` are required; `message` is omitted when empty.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed error carrying the HTTP status and a stable error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Underlying failure, logged but never sent to the client.
    #[serde(skip)]
    pub cause: Option<String>,
}

impl ErrorResponse {
    pub fn bad_request(code: &str, message: &str) -> Self {
        Self {
            status: 400,
            error: code.to_string(),
            message: non_empty(message),
            cause: None,
        }
    }

    pub fn payload_too_large(code: &str, message: &str) -> Self {
        Self {
            status: 413,
            error: code.to_string(),
            message: non_empty(message),
            cause: None,
        }
    }

    pub fn internal_server_error(code: &str, message: &str, cause: Option<String>) -> Self {
        Self {
            status: 500,
            error: code.to_string(),
            message: non_empty(message),
            cause,
        }
    }

    /// Attach the underlying failure.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Decode a payload received from a remote service.
    pub fn decode(body: &[u8]) -> GatewayResult<Self> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            status: u16,
            #[serde(default)]
            error: String,
            #[serde(default)]
            message: Option<String>,
        }

        let raw: Raw = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Other(format!("decoding error response: {e}")))?;
        if raw.status == 0 {
            return Err(GatewayError::Other("missing field status".into()));
        }
        if raw.error.is_empty() {
            return Err(GatewayError::Other("missing field error".into()));
        }
        Ok(Self {
            status: raw.status,
            error: raw.error,
            message: raw.message.filter(|m| !m.is_empty()),
            cause: None,
        })
    }

    /// JSON body for the wire, newline terminated.
    pub fn to_json(&self) -> Vec<u8> {
        let mut body = serde_json::to_vec(self).unwrap_or_else(|_| {
            format!(r#"{{"status":{},"error":"server_error"}}"#, self.status).into_bytes()
        });
        body.push(b'\n');
        body
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(ref message) = self.message {
            write!(f, ": {message}")?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorResponse {}
