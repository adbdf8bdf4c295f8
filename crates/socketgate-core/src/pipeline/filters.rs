//! Built-in filters shared by every call site.

use super::{Context, Filter, Service};
use crate::error::{GatewayError, GatewayResult};
use crate::stats::StatsReceiver;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error};

/// External "the other side went away" signal, carried in the [`Context`].
#[derive(Debug, Clone, Default)]
pub struct CloseSignal(CancellationToken);

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        self.0.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn fired(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.0
    }
}

/// Runs the service in a derived scope that is cancelled when the
/// [`CloseSignal`] in the context fires.
///
/// The watch happens in the same task as the service, so nothing outlives
/// the wrapped call. Without a signal in the context the service runs as is.
#[derive(Debug, Default)]
pub struct CancellationFilter;

impl Filter for CancellationFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let Some(signal) = ctx.value::<CloseSignal>() else {
                return service.call(ctx).await;
            };

            let scoped = ctx.child();
            let _release = scoped.token().clone().drop_guard();
            let mut work = service.call(scoped.clone());

            tokio::select! {
                biased;
                result = &mut work => result,
                _ = signal.fired() => {
                    debug!(service = service.name(), "close signal fired, cancelling");
                    scoped.cancel();
                    work.await
                }
            }
        })
    }
}

/// Turns a panic inside the service into [`GatewayError::Panic`].
#[derive(Debug, Default)]
pub struct RecoveryFilter;

impl Filter for RecoveryFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| service.call(ctx))) {
                Ok(work) => AssertUnwindSafe(work).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(service = service.name(), panic = %message, "recovered from panic");
                Err(GatewayError::Panic(message))
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Records `requests`, `success`, `failure` and `latency` under the
/// service's name.
pub struct StatsFilter {
    stats: Arc<dyn StatsReceiver>,
}

impl StatsFilter {
    pub fn new(stats: Arc<dyn StatsReceiver>) -> Self {
        Self { stats }
    }
}

impl Filter for StatsFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = service.call(ctx).await;
            let latency = start.elapsed();

            let scoped = self.stats.scope(service.name());
            scoped.counter("requests").incr();
            scoped.timer("latency").add(latency);
            if result.is_ok() {
                scoped.counter("success").incr();
            } else {
                scoped.counter("failure").incr();
            }

            result
        })
    }
}

/// Logs every failed call.
#[derive(Debug, Default)]
pub struct ErrorLoggerFilter;

impl Filter for ErrorLoggerFilter {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let result = service.call(ctx).await;
            if let Err(ref e) = result {
                error!(service = service.name(), error = %e, "service error");
            }
            result
        })
    }
}
