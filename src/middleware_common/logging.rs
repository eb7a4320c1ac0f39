//! Job lifecycle logging.
//!
//! Every job gets an `ojs.job` span carrying its type, id, queue and attempt;
//! the start, completion and failure events are emitted inside it, so any
//! logging done by inner middleware or the handler inherits those fields.
//!
//! ```rust,no_run
//! use ojs_worker::middleware_common::logging::LoggingMiddleware;
//!
//! let mw = LoggingMiddleware::new();
//! // worker.use_middleware("logging", mw);
//! ```

use std::time::Instant;

use tracing::Instrument;

use crate::middleware::{BoxFuture, HandlerResult, Middleware, Next};
use crate::worker::JobContext;

/// Logs start at `DEBUG`, completion at `INFO` and failure at `ERROR`.
///
/// The outcome is returned as is; failures are never swallowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for LoggingMiddleware {
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        let span = tracing::info_span!(
            "ojs.job",
            ojs.job.r#type = %ctx.job.job_type,
            ojs.job.id = %ctx.job.id,
            ojs.job.queue = %ctx.job.queue,
            ojs.job.attempt = ctx.attempt(),
        );

        let run = async move {
            tracing::debug!("job started");
            let started = Instant::now();

            let result = next.run(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if let Err(e) = &result {
                tracing::error!(
                    elapsed_ms,
                    error_class = e.error_class(),
                    error = %e.message(),
                    "job failed"
                );
            } else {
                tracing::info!(elapsed_ms, "job completed");
            }
            result
        };

        Box::pin(run.instrument(span))
    }
}
