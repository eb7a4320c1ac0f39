use crate::errors::OjsError;
use crate::worker::JobContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// A boxed future used throughout the middleware system.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The result type returned by job handlers.
///
/// `Ok(Value::Null)` means the handler produced no direct result; the engine
/// then acknowledges with whatever was stored through
/// [`JobContext::set_result`].
pub type HandlerResult = Result<serde_json::Value, OjsError>;

/// A handler function that processes a job.
///
/// Handlers receive a [`JobContext`] and return a JSON result value on success.
pub type HandlerFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Erase an async closure into a [`HandlerFn`].
pub(crate) fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as BoxFuture<'static, HandlerResult>)
}

/// Represents the next handler in the middleware chain.
///
/// Call `run` to pass control to the next middleware or the final handler.
/// A middleware that never calls `run` short-circuits the chain: the handler
/// does not execute and whatever the middleware returns becomes the job's
/// outcome. `Next` is cheap to clone, so a middleware may run the rest of the
/// chain more than once.
#[derive(Clone)]
pub struct Next {
    inner: HandlerFn,
}

impl Next {
    pub(crate) fn new(inner: HandlerFn) -> Self {
        Self { inner }
    }

    /// Pass control to the next middleware or handler.
    pub fn run(self, ctx: JobContext) -> BoxFuture<'static, HandlerResult> {
        (self.inner)(ctx)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Middleware trait (tower-inspired)
// ---------------------------------------------------------------------------

/// Middleware that wraps job handler execution.
///
/// Each middleware wraps the next handler in the chain. The first middleware
/// registered on a worker is the outermost: its code before `next.run` runs
/// first and its code after `next.run` runs last.
///
/// Errors returned by inner middleware or the handler propagate outward
/// unless a middleware converts or suppresses them.
///
/// # Example
///
/// ```rust
/// use ojs_worker::{BoxFuture, HandlerResult, JobContext, Middleware, Next};
/// use std::time::Instant;
///
/// struct TimingMiddleware;
///
/// impl Middleware for TimingMiddleware {
///     fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
///         Box::pin(async move {
///             let start = Instant::now();
///             let result = next.run(ctx).await;
///             tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "job processed");
///             result
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    /// Process a job, optionally delegating to the next handler.
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult>;
}

// ---------------------------------------------------------------------------
// Middleware chain
// ---------------------------------------------------------------------------

pub(crate) struct NamedMiddleware {
    pub name: String,
    pub middleware: Arc<dyn Middleware>,
}

/// An ordered, append-only chain of middleware.
///
/// Appends replace the list with a new copy, so a chain built for an
/// in-flight job keeps the snapshot it started with.
#[derive(Default)]
pub(crate) struct MiddlewareChain {
    middleware: RwLock<Arc<Vec<Arc<NamedMiddleware>>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append middleware to the end of the chain (innermost position).
    pub fn add(&self, name: impl Into<String>, mw: impl Middleware) {
        let entry = Arc::new(NamedMiddleware {
            name: name.into(),
            middleware: Arc::new(mw),
        });

        let mut guard = self
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<_> = guard.as_ref().clone();
        next.push(entry);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Vec<Arc<NamedMiddleware>>> {
        self.middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered middleware names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|m| m.name.clone()).collect()
    }

    /// Build the final handler by wrapping the base handler with all middleware.
    ///
    /// Composed right to left: the last middleware wraps the handler first,
    /// so the first middleware in the list executes outermost.
    pub fn wrap(&self, handler: HandlerFn) -> HandlerFn {
        self.snapshot().iter().rev().fold(handler, |inner, named| {
            let mw = named.middleware.clone();
            let wrapped: HandlerFn =
                Arc::new(move |ctx: JobContext| mw.handle(ctx, Next::new(inner.clone())));
            wrapped
        })
    }
}

// ---------------------------------------------------------------------------
// Convenience: implement Middleware for async closures via a wrapper
// ---------------------------------------------------------------------------

/// A middleware constructed from a closure.
///
/// ```rust
/// use ojs_worker::{FnMiddleware, JobContext, Next};
///
/// let mw = FnMiddleware::new(|ctx: JobContext, next: Next| async move {
///     tracing::debug!(job_id = %ctx.job.id, "before");
///     next.run(ctx).await
/// });
/// ```
pub struct FnMiddleware<F> {
    f: F,
}

impl<F, Fut> FnMiddleware<F>
where
    F: Fn(JobContext, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(JobContext, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(ctx, next))
    }
}
