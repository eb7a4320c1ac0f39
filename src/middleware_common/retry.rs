//! In-process retry middleware.
//!
//! Re-runs the rest of the chain inside the same dispatch when it fails,
//! before the job is ever nack'd. This is independent of the server-side
//! [`RetryPolicy`](crate::RetryPolicy) carried on the job.
//!
//! # Example
//!
//! ```rust,no_run
//! use ojs_worker::middleware_common::retry::RetryMiddleware;
//! use std::time::Duration;
//!
//! let mw = RetryMiddleware::builder()
//!     .max_retries(5)
//!     .base_delay(Duration::from_millis(50))
//!     .build();
//! // worker.use_middleware("retry", mw);
//! ```

use rand::Rng;
use std::time::Duration;

use crate::middleware::{BoxFuture, HandlerResult, Middleware, Next};
use crate::worker::JobContext;

/// Middleware that retries the inner chain on any error.
///
/// Delay before retry `n` (0-based) is `min(base_delay * 2^n, max_delay)`,
/// scaled by a factor drawn from `[0.5, 1.0]` when jitter is on. The last
/// error is returned once the retries are used up.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryMiddleware {
    /// 3 retries, 100ms base delay, 30s cap, jitter on.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RetryMiddlewareBuilder {
        RetryMiddlewareBuilder {
            inner: Self::default(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

impl Middleware for RetryMiddleware {
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        let policy = self.clone();

        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match next.clone().run(ctx.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) if attempt >= policy.max_retries => return Err(err),
                    Err(err) => {
                        let delay = policy.delay_for(attempt);
                        tracing::debug!(
                            ojs.job.id = %ctx.job.id,
                            ojs.job.r#type = %ctx.job.job_type,
                            retry = attempt + 1,
                            max_retries = policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err.message(),
                            "retrying job in-process"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        })
    }
}

/// Builder for [`RetryMiddleware`].
#[derive(Debug, Clone)]
pub struct RetryMiddlewareBuilder {
    inner: RetryMiddleware,
}

impl RetryMiddlewareBuilder {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.inner.max_retries = n;
        self
    }

    pub fn base_delay(mut self, d: Duration) -> Self {
        self.inner.base_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.inner.max_delay = d;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.inner.jitter = enabled;
        self
    }

    pub fn build(self) -> RetryMiddleware {
        self.inner
    }
}
