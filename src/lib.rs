#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::float_cmp)]
//! # ojs-worker
//!
//! Worker and producer library for [Open Job Spec](https://openjobspec.org)
//! servers. Producers enqueue jobs over HTTP; workers poll for them, run the
//! registered handler through a middleware chain, and acknowledge the outcome.
//!
//! ## Processing Jobs
//!
//! ```rust,no_run
//! use ojs_worker::middleware_common::logging::LoggingMiddleware;
//! use ojs_worker::{JobContext, Worker};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> ojs_worker::Result<()> {
//! let worker = Worker::builder()
//!     .url("http://localhost:8080")
//!     .queues(vec!["default", "email"])
//!     .concurrency(10)
//!     .build()?;
//!
//! worker.use_middleware("logging", LoggingMiddleware::new());
//! worker.register("email.send", |ctx: JobContext| async move {
//!     let to: String = ctx.job.arg("to")?;
//!     // send the email...
//!     Ok(json!({"status": "sent", "to": to}))
//! })?;
//!
//! worker.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Enqueuing Jobs
//!
//! ```rust,no_run
//! use ojs_worker::Client;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> ojs_worker::Result<()> {
//! let client = Client::builder().url("http://localhost:8080").build()?;
//! let job = client.enqueue("email.send", json!({"to": "user@example.com"})).await?;
//! let job = client.get_job(&job.id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery guarantees
//!
//! Each fetched job is acknowledged or nack'd exactly once, after its chain
//! returns. Ack and nack calls are best-effort: if they fail after retries the
//! server's lease expiry redelivers the job.

pub mod client;
pub mod config;
pub mod errors;
pub mod job;
pub mod middleware;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod worker;

/// Common middleware implementations (logging, timeout, retry, metrics).
#[cfg(feature = "common-middleware")]
#[cfg_attr(docsrs, doc(cfg(feature = "common-middleware")))]
pub mod middleware_common;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use client::{Client, ClientBuilder, NewJob};
pub use config::ConnectionConfig;
pub use errors::{HandlerError, JobError, OjsError, Result, ServerError};
pub use job::{Job, JobState};
pub use middleware::{BoxFuture, FnMiddleware, HandlerFn, HandlerResult, Middleware, Next};
pub use queue::{
    CronJob, CronJobRequest, DeadLetterPage, OverlapPolicy, Pagination, Queue, QueueCounts,
    QueueStats,
};
pub use retry::{OnExhaustion, RetryPolicy, RetryPolicyBuilder};
#[cfg(feature = "reqwest-transport")]
pub use transport::HttpTransport;
pub use transport::{
    DynTransport, Method as TransportMethod, RetryConfig, RetryableTransport, Transport,
};
pub use worker::{JobContext, Worker, WorkerBuilder, WorkerState};

/// The OJS specification version spoken by this crate.
pub const OJS_VERSION: &str = job::SPEC_VERSION;
