//! Timeout middleware for OJS job processing.
//!
//! Runs the rest of the chain on its own task and aborts it once the
//! deadline passes.
//!
//! # Example
//!
//! ```rust,no_run
//! use ojs_worker::middleware_common::timeout::TimeoutMiddleware;
//! use std::time::Duration;
//!
//! let mw = TimeoutMiddleware::new(Duration::from_secs(30));
//! // worker.use_middleware("timeout", mw);
//! ```

use std::time::Duration;

use crate::errors::OjsError;
use crate::middleware::{BoxFuture, HandlerResult, Middleware, Next};
use crate::worker::JobContext;

/// Middleware that aborts job execution after a configurable timeout.
///
/// If the inner chain does not finish within the duration, its task is
/// aborted and the job fails with [`OjsError::Timeout`]. Errors raised before
/// the deadline are returned as they are, and a panic inside the chain is
/// resumed on the calling task.
///
/// Aborting only takes effect at the handler's next `.await`; blocking code
/// keeps running on its worker thread.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        let duration = self.duration;
        let job_id = ctx.job.id.clone();
        let job_type = ctx.job.job_type.clone();

        Box::pin(async move {
            let mut task = tokio::spawn(next.run(ctx));

            match tokio::time::timeout(duration, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Ok(Err(join_err)) => Err(OjsError::handler_message(format!(
                    "job {} (id={}) was cancelled: {}",
                    job_type, job_id, join_err
                ))),
                Err(_elapsed) => {
                    task.abort();
                    Err(OjsError::Timeout {
                        job_type,
                        job_id,
                        duration,
                    })
                }
            }
        })
    }
}
