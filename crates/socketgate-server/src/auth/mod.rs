//! Connection authentication.
//!
//! The credential check itself is a black box behind [`Authenticator`]; the
//! lifecycle only needs an identity back.

pub mod cookie;

pub use cookie::CookieAuthenticator;

use futures_util::future::BoxFuture;
use socketgate_core::GatewayResult;

/// What the gateway saw of the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub path: String,
    /// Header name (lowercase) and value, in arrival order.
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Values of every header named `name`, case-insensitively.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Turns a handshake into an authenticated identity.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(&'a self, request: &'a HandshakeRequest) -> BoxFuture<'a, GatewayResult<String>>;
}
