//! `POST /websocket/{id}/send`: push the raw request body to a connection.

use super::exchange::{Exchange, JSON_CONTENT_TYPE};
use crate::relay::{Registry, SendRequest, Sender};
use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use http_body_util::LengthLimitError;
use socketgate_core::{ConnectionId, Context, ErrorResponse, GatewayError, GatewayResult, Service};
use std::error::Error;

/// Largest accepted request body (1 MiB).
pub const MAX_BODY_SIZE: usize = 1_048_576;

/// Path parameter holding the hex connection id.
pub const DEVICE_ID_PARAM: &str = "device_id";

/// Decodes the request and hands it to the [`Sender`]. An empty body is
/// rejected there and surfaces as 400 `invalid_request`.
pub struct SocketSendMsg {
    sender: Sender,
}

impl SocketSendMsg {
    pub fn new(registry: Registry) -> Self {
        Self {
            sender: Sender::new(registry),
        }
    }

    async fn decode(exchange: &Exchange) -> GatewayResult<SendRequest> {
        let connection_id: ConnectionId = exchange
            .param(DEVICE_ID_PARAM)
            .unwrap_or_default()
            .parse()
            .map_err(|e| ErrorResponse::bad_request("invalid_request", "Invalid device id").with_cause(e))?;

        let body = exchange.take_body().unwrap_or_default();
        let data = axum::body::to_bytes(body, MAX_BODY_SIZE).await.map_err(|e| {
            if exceeds_limit(&e) {
                ErrorResponse::payload_too_large("request_too_large", "Request body too large")
                    .with_cause(e)
            } else {
                ErrorResponse::internal_server_error("server_error", "Unable to read request body", None)
                    .with_cause(e)
            }
        })?;

        Ok(SendRequest {
            connection_id,
            data: data.to_vec(),
        })
    }
}

/// Whether a body read failed on the size cap rather than on I/O.
fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

impl Service for SocketSendMsg {
    fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let exchange = ctx
                .value::<Exchange>()
                .ok_or_else(|| GatewayError::Other("no HTTP exchange in context".into()))?;

            let request = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(GatewayError::Cancelled),
                decoded = Self::decode(&exchange) => decoded?,
            };
            self.sender
                .send_message(&ctx, request)
                .await
                .map_err(|e| match e {
                    GatewayError::InvalidMessage(reason) => {
                        ErrorResponse::bad_request("invalid_request", "Empty message")
                            .with_cause(reason)
                            .into()
                    }
                    other => other,
                })?;

            exchange.respond(StatusCode::ACCEPTED, JSON_CONTENT_TYPE, "{}\n");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "websocketsendmessage"
    }
}
