//! Presence tracker client.

use super::until_cancelled;
use futures_util::future::BoxFuture;
use serde::Serialize;
use socketgate_core::{ConnectionId, Context, GatewayError, GatewayResult};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const CALL: &str = "presence.set_status";

/// Liveness reported for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Online => f.write_str("online"),
            Status::Offline => f.write_str("offline"),
        }
    }
}

/// Records which identity owns a connection and whether it is live.
pub trait PresenceClient: Send + Sync {
    fn set_status<'a>(
        &'a self,
        ctx: &'a Context,
        id: ConnectionId,
        identity: &'a str,
        status: Status,
    ) -> BoxFuture<'a, GatewayResult<()>>;
}

#[derive(Serialize)]
struct StatusBody<'a> {
    user_id: &'a str,
    status: Status,
}

/// `PUT {base}/status/websocket/{id}` with `{"user_id", "status"}`.
/// Anything but 200 is a failure.
pub struct HttpPresenceClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPresenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("presence client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn status_url(&self, id: ConnectionId) -> String {
        format!("{}/status/websocket/{id}", self.base_url)
    }
}

impl PresenceClient for HttpPresenceClient {
    fn set_status<'a>(
        &'a self,
        ctx: &'a Context,
        id: ConnectionId,
        identity: &'a str,
        status: Status,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(until_cancelled(ctx, async move {
            let response = self
                .http
                .put(self.status_url(id))
                .json(&StatusBody {
                    user_id: identity,
                    status,
                })
                .send()
                .await
                .map_err(|e| GatewayError::rpc(CALL, e))?;

            if response.status() != reqwest::StatusCode::OK {
                return Err(GatewayError::rpc(
                    CALL,
                    format!("unexpected status {}", response.status()),
                ));
            }
            debug!(conn_id = %id, %status, "presence updated");
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpPresenceClient {
        HttpPresenceClient::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn puts_status_for_connection() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/status/websocket/7b"))
            .and(body_json(json!({"user_id": "user1", "status": "online"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let id = ConnectionId::new(0x7b).unwrap();
        client(&server)
            .set_status(&Context::background(), id, "user1", Status::Online)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_200_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let id = ConnectionId::new(1).unwrap();
        let err = client(&server)
            .set_status(&Context::background(), id, "user1", Status::Offline)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rpc { call: CALL, .. }));
    }

    #[tokio::test]
    async fn cancelled_context_aborts_call() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let ctx = Context::background();
        ctx.cancel();
        let id = ConnectionId::new(1).unwrap();
        let err = client(&server)
            .set_status(&ctx, id, "user1", Status::Online)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Online).unwrap(), "\"online\"");
        assert_eq!(Status::Offline.to_string(), "offline");
    }
}
