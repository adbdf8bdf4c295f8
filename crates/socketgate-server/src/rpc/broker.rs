//! Message broker client.

use super::until_cancelled;
use futures_util::future::BoxFuture;
use socketgate_core::{Context, GatewayError, GatewayResult};
use std::time::Duration;

const CALL: &str = "broker.route";

/// Accepts messages read from client connections.
pub trait BrokerClient: Send + Sync {
    fn route<'a>(&'a self, ctx: &'a Context, payload: Vec<u8>) -> BoxFuture<'a, GatewayResult<()>>;
}

/// `POST {base}/route` with the raw payload. Any 2xx is a success.
pub struct HttpBrokerClient {
    route_url: String,
    http: reqwest::Client,
}

impl HttpBrokerClient {
    pub fn new(base_url: &str, timeout: Duration) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("broker client: {e}")))?;
        Ok(Self {
            route_url: format!("{}/route", base_url.trim_end_matches('/')),
            http,
        })
    }
}

impl BrokerClient for HttpBrokerClient {
    fn route<'a>(&'a self, ctx: &'a Context, payload: Vec<u8>) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(until_cancelled(ctx, async move {
            let response = self
                .http
                .post(&self.route_url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(payload)
                .send()
                .await
                .map_err(|e| GatewayError::rpc(CALL, e))?;

            if !response.status().is_success() {
                return Err(GatewayError::rpc(
                    CALL,
                    format!("unexpected status {}", response.status()),
                ));
            }
            Ok(())
        }))
    }
}
