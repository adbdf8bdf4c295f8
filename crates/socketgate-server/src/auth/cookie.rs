//! Session cookie authentication.

use super::{Authenticator, HandshakeRequest};
use futures_util::future::BoxFuture;
use socketgate_core::{GatewayError, GatewayResult};

/// Reads the session token from a named cookie. The token is the identity.
#[derive(Debug, Clone)]
pub struct CookieAuthenticator {
    cookie: String,
}

impl CookieAuthenticator {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    fn token<'a>(&self, request: &'a HandshakeRequest) -> Option<&'a str> {
        request
            .header_values("cookie")
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie)
            .map(|(_, value)| value.trim_matches('"'))
    }
}

impl Authenticator for CookieAuthenticator {
    fn authenticate<'a>(&'a self, request: &'a HandshakeRequest) -> BoxFuture<'a, GatewayResult<String>> {
        let result = match self.token(request) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(GatewayError::Auth(format!("missing {} cookie", self.cookie))),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cookies: &[&str]) -> HandshakeRequest {
        HandshakeRequest {
            path: "/".into(),
            headers: cookies
                .iter()
                .map(|c| ("cookie".to_string(), c.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn reads_named_cookie() {
        let auth = CookieAuthenticator::new("auth");
        let identity = auth
            .authenticate(&request(&["theme=dark; auth=user1; lang=en"]))
            .await
            .unwrap();
        assert_eq!(identity, "user1");
    }

    #[tokio::test]
    async fn searches_every_cookie_header() {
        let auth = CookieAuthenticator::new("auth");
        let identity = auth
            .authenticate(&request(&["theme=dark", "auth=\"user2\""]))
            .await
            .unwrap();
        assert_eq!(identity, "user2");
    }

    #[tokio::test]
    async fn missing_or_empty_cookie_fails() {
        let auth = CookieAuthenticator::new("auth");
        for cookies in [&[][..], &["theme=dark"][..], &["auth="][..], &["xauth=user1"][..]] {
            let err = auth.authenticate(&request(cookies)).await.unwrap_err();
            assert!(matches!(err, GatewayError::Auth(_)), "accepted {cookies:?}");
        }
    }

    #[tokio::test]
    async fn cookie_name_is_configurable() {
        let auth = CookieAuthenticator::new("session");
        let identity = auth
            .authenticate(&request(&["auth=user1; session=user9"]))
            .await
            .unwrap();
        assert_eq!(identity, "user9");
    }
}
