//! Filters that only make sense around an HTTP exchange.
//!
//! Each one looks up the [`Exchange`] in the context and passes the call
//! through untouched when there is none.

use super::exchange::{Exchange, JSON_CONTENT_TYPE};
use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use socketgate_core::{Context, Filter, GatewayResult, Service, StatsReceiver};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Writes a failed call's error as the HTTP response.
///
/// Typed [`ErrorResponse`]s keep their status and payload; anything else
/// becomes a generic 500. The error still propagates to outer filters.
///
/// [`ErrorResponse`]: socketgate_core::ErrorResponse
#[derive(Debug, Default)]
pub struct ErrorResponseFilter;

impl Filter for ErrorResponseFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let exchange = ctx.value::<Exchange>();
            let result = service.call(ctx).await;
            if let (Err(e), Some(exchange)) = (&result, exchange) {
                let payload = e.to_response();
                let status =
                    StatusCode::from_u16(payload.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                exchange.respond(status, JSON_CONTENT_TYPE, payload.to_json());
            }
            result
        })
    }
}

/// Counts and times responses per status code and per status class under
/// `<service>.http.status` and `<service>.http.time`.
pub struct ResponseStatsFilter {
    stats: Arc<dyn StatsReceiver>,
}

impl ResponseStatsFilter {
    pub fn new(stats: Arc<dyn StatsReceiver>) -> Self {
        Self { stats }
    }
}

impl Filter for ResponseStatsFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let exchange = ctx.value::<Exchange>();
            let start = Instant::now();
            let result = service.call(ctx).await;
            let latency = start.elapsed();

            if let Some(exchange) = exchange {
                let code = exchange.status().as_u16();
                let code_name = code.to_string();
                let class_name = format!("{}xx", code / 100);

                let scoped = self.stats.scope(service.name());
                let by_status = scoped.scope("http.status");
                let by_time = scoped.scope("http.time");
                by_status.counter(&code_name).incr();
                by_status.counter(&class_name).incr();
                by_time.timer(&code_name).add(latency);
                by_time.timer(&class_name).add(latency);
            }
            result
        })
    }
}

/// Logs one line per request: remote, method, path, status and latency.
#[derive(Debug, Default)]
pub struct RequestLogFilter;

impl Filter for RequestLogFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let exchange = ctx.value::<Exchange>();
            let start = Instant::now();
            let result = service.call(ctx).await;

            if let Some(exchange) = exchange {
                let remote = exchange
                    .remote
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    remote = %remote,
                    method = %exchange.method,
                    path = %exchange.path,
                    status = exchange.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "request"
                );
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use socketgate_core::pipeline::{apply, service_fn, RecoveryFilter};
    use socketgate_core::{ErrorResponse, GatewayError, StatsRecorder};
    use std::collections::HashMap;

    fn exchange_context() -> (Context, Arc<Exchange>) {
        let exchange = Arc::new(Exchange::new(
            "POST",
            "/websocket/7b/send",
            None,
            HashMap::new(),
            Body::empty(),
        ));
        (Context::background().with_value(exchange.clone()), exchange)
    }

    async fn body_json(exchange: &Exchange) -> serde_json::Value {
        let body = axum::body::to_bytes(exchange.to_response().into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn typed_error_is_written() {
        let (ctx, exchange) = exchange_context();
        let service = service_fn("svc", |_ctx: Context| async {
            Err(GatewayError::from(ErrorResponse::bad_request(
                "invalid_request",
                "Invalid device id",
            )))
        });

        let result = ErrorResponseFilter.call(ctx, &service).await;
        assert!(result.is_err());
        assert_eq!(exchange.status(), StatusCode::BAD_REQUEST);
        let json = body_json(&exchange).await;
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(json["message"], "Invalid device id");
    }

    #[tokio::test]
    async fn untyped_error_is_generic_500() {
        let (ctx, exchange) = exchange_context();
        let service = service_fn("svc", |_ctx: Context| async {
            Err(GatewayError::Other("database password is hunter2".into()))
        });

        let _ = ErrorResponseFilter.call(ctx, &service).await;
        assert_eq!(exchange.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(&exchange).await;
        assert_eq!(json["error"], "server_error");
        assert!(!json.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn panic_becomes_500() {
        let (ctx, exchange) = exchange_context();
        let service = apply(
            Arc::new(service_fn("svc", |_ctx: Context| async {
                if true {
                    panic!("index out of bounds");
                }
                Ok(())
            })),
            vec![Arc::new(ErrorResponseFilter), Arc::new(RecoveryFilter)],
        );

        let result = service.call(ctx).await;
        assert!(matches!(result, Err(GatewayError::Panic(_))));
        assert_eq!(exchange.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn success_writes_nothing() {
        let (ctx, exchange) = exchange_context();
        let service = service_fn("svc", |_ctx: Context| async { Ok(()) });
        ErrorResponseFilter.call(ctx, &service).await.unwrap();
        assert!(!exchange.is_written());
    }

    #[tokio::test]
    async fn response_stats_by_code_and_class() {
        let stats = StatsRecorder::new();
        let filter = ResponseStatsFilter::new(Arc::new(stats.clone()));

        for status in [StatusCode::ACCEPTED, StatusCode::ACCEPTED, StatusCode::BAD_REQUEST] {
            let (ctx, _exchange) = exchange_context();
            let service = service_fn("svc", move |ctx: Context| async move {
                if let Some(exchange) = ctx.value::<Exchange>() {
                    exchange.respond(status, JSON_CONTENT_TYPE, "{}\n");
                }
                Ok(())
            });
            filter.call(ctx, &service).await.unwrap();
        }

        assert_eq!(stats.counter_value("svc.http.status.202"), 2);
        assert_eq!(stats.counter_value("svc.http.status.2xx"), 2);
        assert_eq!(stats.counter_value("svc.http.status.400"), 1);
        assert_eq!(stats.counter_value("svc.http.status.4xx"), 1);
        let snapshot = stats.snapshot();
        assert!(snapshot.timers.contains_key("svc.http.time.202"));
        assert!(snapshot.timers.contains_key("svc.http.time.4xx"));
    }

    #[tokio::test]
    async fn filters_pass_through_without_exchange() {
        let stats = StatsRecorder::new();
        let service = apply(
            Arc::new(service_fn("svc", |_ctx: Context| async {
                Err(GatewayError::Other("x".into()))
            })),
            vec![
                Arc::new(RequestLogFilter),
                Arc::new(ResponseStatsFilter::new(Arc::new(stats.clone()))),
                Arc::new(ErrorResponseFilter),
            ],
        );
        assert!(service.call(Context::background()).await.is_err());
        assert!(stats.snapshot().counters.is_empty());
    }
}
