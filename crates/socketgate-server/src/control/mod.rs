//! Control-plane HTTP endpoint.
//!
//! Backends push messages to connected clients with
//! `POST /websocket/{id-hex}/send`. The handler wraps each request in an
//! [`Exchange`] and runs it through the endpoint's filter pipeline.

pub mod exchange;
pub mod filters;
pub mod send;

pub use exchange::Exchange;
pub use filters::{ErrorResponseFilter, RequestLogFilter, ResponseStatsFilter};
pub use send::SocketSendMsg;

use crate::relay::Registry;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use socketgate_core::pipeline::{
    CancellationFilter, CloseSignal, ErrorLoggerFilter, RecoveryFilter, StatsFilter,
};
use socketgate_core::{apply, Context, Service, StatsReceiver};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// The send endpoint with its full filter stack, outermost first.
pub fn send_endpoint(registry: Registry, stats: Arc<dyn StatsReceiver>) -> Arc<dyn Service> {
    apply(
        Arc::new(SocketSendMsg::new(registry)),
        vec![
            Arc::new(RequestLogFilter),
            Arc::new(ResponseStatsFilter::new(stats.clone())),
            Arc::new(StatsFilter::new(stats)),
            Arc::new(CancellationFilter),
            Arc::new(ErrorResponseFilter),
            Arc::new(ErrorLoggerFilter),
            Arc::new(RecoveryFilter),
        ],
    )
}

/// Create the control-plane router.
pub fn router(registry: Registry, stats: Arc<dyn StatsReceiver>) -> Router {
    Router::new()
        .route("/websocket/:device_id/send", post(serve))
        .with_state(send_endpoint(registry, stats))
}

async fn serve(
    State(endpoint): State<Arc<dyn Service>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (parts, body) = request.into_parts();
    let exchange = Arc::new(Exchange::new(
        parts.method.as_str(),
        parts.uri.path(),
        remote,
        params,
        body,
    ));

    let signal = Arc::new(CloseSignal::new());
    let ctx = Context::background()
        .with_value(exchange.clone())
        .with_value(signal.clone());

    // axum drops this future when the client disconnects; the guard then
    // fires the close signal and the pipeline cancels the work.
    let _disconnect = signal.token().clone().drop_guard();
    let work = tokio::spawn(async move { endpoint.call(ctx).await });
    if let Err(e) = work.await {
        error!(error = %e, "control request task failed");
    }
    exchange.to_response()
}
