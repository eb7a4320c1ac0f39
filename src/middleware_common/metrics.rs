//! Metrics middleware for OJS job processing.
//!
//! Keeps in-process counters keyed by `"<type>:<queue>"` and optionally
//! forwards every event to a [`MetricsRecorder`] for an external backend
//! (Prometheus, StatsD, etc.).
//!
//! # Example
//!
//! ```rust,no_run
//! use ojs_worker::middleware_common::metrics::{MetricsMiddleware, MetricsRecorder};
//! use std::sync::Arc;
//!
//! struct MyRecorder;
//!
//! impl MetricsRecorder for MyRecorder {
//!     fn job_started(&self, job_type: &str, queue: &str) {}
//!     fn job_completed(&self, job_type: &str, queue: &str, duration_ms: u128) {}
//!     fn job_failed(&self, job_type: &str, queue: &str, duration_ms: u128, error: &str) {}
//! }
//!
//! let metrics = MetricsMiddleware::new().with_recorder(Arc::new(MyRecorder));
//! // worker.use_middleware("metrics", metrics.clone());
//! // later: metrics.snapshot().total_processed()
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::middleware::{BoxFuture, HandlerResult, Middleware, Next};
use crate::worker::JobContext;

/// Trait for forwarding job execution metrics to an external system.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Called when a job starts processing.
    fn job_started(&self, job_type: &str, queue: &str);

    /// Called when a job completes successfully.
    fn job_completed(&self, job_type: &str, queue: &str, duration_ms: u128);

    /// Called when a job fails with an error.
    fn job_failed(&self, job_type: &str, queue: &str, duration_ms: u128, error: &str);
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_completed: u64,
    pub total_failed: u64,
    pub completed_by_key: HashMap<String, u64>,
    pub failed_by_key: HashMap<String, u64>,
    /// Summed execution time, successes and failures alike.
    pub duration_by_key: HashMap<String, Duration>,
}

impl MetricsSnapshot {
    pub fn total_processed(&self) -> u64 {
        self.total_completed + self.total_failed
    }
}

/// Middleware that counts completed and failed jobs per `(type, queue)`.
///
/// Clones share the same counters, so keep one clone to read
/// [`snapshot`](Self::snapshot) after registering another on the worker.
#[derive(Clone, Default)]
pub struct MetricsMiddleware {
    counters: Arc<Mutex<MetricsSnapshot>>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward every event to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Counters as of every job that finished before this call.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, key: String, elapsed: Duration, succeeded: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if succeeded {
            counters.total_completed += 1;
            *counters.completed_by_key.entry(key.clone()).or_default() += 1;
        } else {
            counters.total_failed += 1;
            *counters.failed_by_key.entry(key.clone()).or_default() += 1;
        }
        *counters.duration_by_key.entry(key).or_default() += elapsed;
    }
}

impl std::fmt::Debug for MetricsMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsMiddleware")
            .field("snapshot", &self.snapshot())
            .field("has_recorder", &self.recorder.is_some())
            .finish()
    }
}

impl Middleware for MetricsMiddleware {
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        let this = self.clone();
        let job_type = ctx.job.job_type.clone();
        let queue = ctx.job.queue.clone();

        Box::pin(async move {
            if let Some(recorder) = &this.recorder {
                recorder.job_started(&job_type, &queue);
            }
            let start = Instant::now();

            let result = next.run(ctx).await;
            let elapsed = start.elapsed();
            let key = format!("{}:{}", job_type, queue);

            this.record(key, elapsed, result.is_ok());
            if let Some(recorder) = &this.recorder {
                match &result {
                    Ok(_) => recorder.job_completed(&job_type, &queue, elapsed.as_millis()),
                    Err(e) => {
                        recorder.job_failed(&job_type, &queue, elapsed.as_millis(), &e.message())
                    }
                }
            }

            result
        })
    }
}
