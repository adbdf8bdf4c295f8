//! Request pipeline: a unit of work ([`Service`]) wrapped by ordered
//! behaviors ([`Filter`]).
//!
//! Filters compose as an onion. `apply(s, [a, b, c])` runs
//! `a-before, b-before, c-before, s, c-after, b-after, a-after`, so the
//! innermost filter sees whatever scope the outer ones established and the
//! outermost filter observes the final outcome of everything inside it.
//!
//! Every invocation carries a [`Context`]: a cancellation token plus typed
//! values (for example the HTTP exchange being served).

pub mod filters;

pub use filters::{
    CancellationFilter, CloseSignal, ErrorLoggerFilter, RecoveryFilter, StatsFilter,
};

use crate::error::GatewayResult;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Cancellation scope and request-scoped values for one invocation.
#[derive(Clone, Default)]
pub struct Context {
    token: CancellationToken,
    values: Arc<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    /// An empty context that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            values: Arc::default(),
        }
    }

    /// Derive a cancelable scope. Cancelling the parent cancels the child,
    /// never the other way around.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            values: self.values.clone(),
        }
    }

    /// Attach a value; later lookups of the same type see the newest one.
    pub fn with_value<T: Any + Send + Sync>(&self, value: Arc<T>) -> Self {
        let mut values = Vec::with_capacity(self.values.len() + 1);
        values.extend(self.values.iter().cloned());
        values.push(value as Arc<dyn Any + Send + Sync>);
        Self {
            token: self.token.clone(),
            values: Arc::new(values),
        }
    }

    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .iter()
            .rev()
            .find_map(|v| v.clone().downcast::<T>().ok())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this scope is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// A unit of work.
pub trait Service: Send + Sync {
    fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>>;

    /// Logical operation name, used to scope statistics and logs.
    fn name(&self) -> &str;
}

/// Behavior wrapped around a service. A filter may run code before and
/// after `service`, skip it, or replace its outcome, but calls it at most once.
pub trait Filter: Send + Sync {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>>;
}

/// Service backed by a closure.
pub struct FnService<F> {
    name: String,
    f: F,
}

/// Build a named service from a closure returning a future.
pub fn service_fn<F, Fut>(name: impl Into<String>, f: F) -> FnService<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<()>> + Send + 'static,
{
    FnService {
        name: name.into(),
        f,
    }
}

impl<F, Fut> Service for FnService<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<()>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin((self.f)(ctx))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Service that does nothing.
pub struct NoopService;

impl Service for NoopService {
    fn call(&self, _ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

struct Filtered {
    inner: Arc<dyn Service>,
    filter: Arc<dyn Filter>,
}

impl Service for Filtered {
    fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
        self.filter.call(ctx, &*self.inner)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Wrap `service` in `filters`; the first filter is the outermost.
///
/// The result keeps the wrapped service's name.
pub fn apply(service: Arc<dyn Service>, filters: Vec<Arc<dyn Filter>>) -> Arc<dyn Service> {
    filters.into_iter().rev().fold(service, |inner, filter| {
        Arc::new(Filtered { inner, filter }) as Arc<dyn Service>
    })
}

/// Compose filters into one; the first filter is the outermost.
pub fn chain(filters: Vec<Arc<dyn Filter>>) -> Arc<dyn Filter> {
    Arc::new(Chain { filters })
}

struct Chain {
    filters: Vec<Arc<dyn Filter>>,
}

impl Filter for Chain {
    fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
        run_chain(&self.filters, ctx, service)
    }
}

fn run_chain<'a>(
    filters: &'a [Arc<dyn Filter>],
    ctx: Context,
    service: &'a dyn Service,
) -> BoxFuture<'a, GatewayResult<()>> {
    match filters.split_first() {
        None => service.call(ctx),
        Some((first, rest)) => Box::pin(async move {
            let next = ChainRest {
                filters: rest,
                service,
            };
            first.call(ctx, &next).await
        }),
    }
}

/// The part of a chain below the filter currently running.
struct ChainRest<'a> {
    filters: &'a [Arc<dyn Filter>],
    service: &'a dyn Service,
}

impl Service for ChainRest<'_> {
    fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
        run_chain(self.filters, ctx, self.service)
    }

    fn name(&self) -> &str {
        self.service.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<String>);

    fn write(ctx: &Context, s: &str) {
        let log = ctx.value::<Log>().expect("log in context");
        log.0.lock().unwrap().push_str(s);
    }

    fn logged_context() -> (Context, Arc<Log>) {
        let log = Arc::new(Log::default());
        (Context::background().with_value(log.clone()), log)
    }

    struct NamedService(&'static str);

    impl Service for NamedService {
        fn call(&self, ctx: Context) -> BoxFuture<'_, GatewayResult<()>> {
            Box::pin(async move {
                write(&ctx, "service");
                Ok(())
            })
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct NameFilter(&'static str);

    impl Filter for NameFilter {
        fn call<'a>(&'a self, ctx: Context, service: &'a dyn Service) -> BoxFuture<'a, GatewayResult<()>> {
            Box::pin(async move {
                write(&ctx, &format!("{}-", self.0));
                let result = service.call(ctx.clone()).await;
                write(&ctx, &format!("-{}", self.0));
                result
            })
        }
    }

    fn filters(names: &[&'static str]) -> Vec<Arc<dyn Filter>> {
        names
            .iter()
            .map(|n| Arc::new(NameFilter(*n)) as Arc<dyn Filter>)
            .collect()
    }

    #[tokio::test]
    async fn chain_one() {
        let (ctx, log) = logged_context();
        chain(filters(&["A"]))
            .call(ctx, &NamedService("servicename"))
            .await
            .unwrap();
        assert_eq!(*log.0.lock().unwrap(), "A-service-A");
    }

    #[tokio::test]
    async fn chain_multiple() {
        let (ctx, log) = logged_context();
        chain(filters(&["A", "B", "C"]))
            .call(ctx, &NamedService("servicename"))
            .await
            .unwrap();
        assert_eq!(*log.0.lock().unwrap(), "A-B-C-service-C-B-A");
    }

    #[tokio::test]
    async fn apply_one() {
        let (ctx, log) = logged_context();
        apply(Arc::new(NamedService("servicename")), filters(&["A"]))
            .call(ctx)
            .await
            .unwrap();
        assert_eq!(*log.0.lock().unwrap(), "A-service-A");
    }

    #[tokio::test]
    async fn apply_multiple() {
        let (ctx, log) = logged_context();
        apply(Arc::new(NamedService("servicename")), filters(&["A", "B", "C"]))
            .call(ctx)
            .await
            .unwrap();
        assert_eq!(*log.0.lock().unwrap(), "A-B-C-service-C-B-A");
    }

    #[tokio::test]
    async fn apply_chain_nested() {
        let (ctx, log) = logged_context();
        let service = apply(
            Arc::new(NamedService("servicename")),
            vec![
                Arc::new(NameFilter("A")) as Arc<dyn Filter>,
                chain(filters(&["B", "C"])),
            ],
        );
        service.call(ctx).await.unwrap();
        assert_eq!(*log.0.lock().unwrap(), "A-B-C-service-C-B-A");
    }

    #[test]
    fn applied_service_keeps_name() {
        let service = apply(Arc::new(NamedService("servicename")), filters(&["A"]));
        assert_eq!(service.name(), "servicename");
        assert_eq!(apply(Arc::new(NoopService), Vec::new()).name(), "noop");
    }

    #[tokio::test]
    async fn service_fn_runs_closure() {
        let (ctx, log) = logged_context();
        let service = service_fn("closure", |ctx: Context| async move {
            write(&ctx, "ran");
            Ok(())
        });
        assert_eq!(service.name(), "closure");
        service.call(ctx).await.unwrap();
        assert_eq!(*log.0.lock().unwrap(), "ran");
    }

    #[test]
    fn newest_value_wins() {
        let ctx = Context::background()
            .with_value(Arc::new(1u32))
            .with_value(Arc::new(2u32));
        assert_eq!(*ctx.value::<u32>().unwrap(), 2);
        assert!(ctx.value::<String>().is_none());
    }

    #[test]
    fn child_cancellation_is_one_way() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
