//! Worker job processing example.
//!
//! Demonstrates how to create a worker, register handlers, stack the common
//! middleware plus a custom one, and process jobs with graceful shutdown.
//!
//! Run against a local OJS server:
//!
//! ```text
//! RUST_LOG=info cargo run --example worker_processing
//! ```

use ojs_worker::middleware_common::logging::LoggingMiddleware;
use ojs_worker::middleware_common::metrics::MetricsMiddleware;
use ojs_worker::middleware_common::retry::RetryMiddleware;
use ojs_worker::middleware_common::timeout::TimeoutMiddleware;
use ojs_worker::{BoxFuture, HandlerResult, JobContext, Middleware, Next, Worker};
use serde_json::json;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Custom middleware: tenant tagging
// ---------------------------------------------------------------------------

/// Copies `meta.tenant` into the span of everything the job logs.
struct TenantMiddleware;

impl Middleware for TenantMiddleware {
    fn handle(&self, ctx: JobContext, next: Next) -> BoxFuture<'static, HandlerResult> {
        let tenant = ctx
            .job
            .meta
            .get("tenant")
            .and_then(|v| v.as_str())
            .unwrap_or("none")
            .to_string();
        let span = tracing::info_span!("tenant", tenant = %tenant);

        Box::pin(tracing::Instrument::instrument(next.run(ctx), span))
    }
}

// ---------------------------------------------------------------------------
// Job handlers
// ---------------------------------------------------------------------------

async fn handle_email_send(ctx: JobContext) -> HandlerResult {
    let to: String = ctx.job.arg("to")?;
    let subject: String = ctx
        .job
        .arg("subject")
        .unwrap_or_else(|_| "No Subject".into());

    tracing::info!(%to, %subject, "sending email");

    // Simulate work
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(json!({
        "message_id": format!("msg_{}", ctx.job.id),
        "delivered": true,
    }))
}

async fn handle_report_generate(ctx: JobContext) -> HandlerResult {
    let report_id: u64 = ctx.job.arg("report_id")?;

    // Long-running work: extend the lease as we go.
    for i in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if ctx.is_cancelled() {
            return Err(ojs_worker::OjsError::handler_message("report cancelled"));
        }
        let _ = ctx.heartbeat().await;
        tracing::info!(report_id, progress = (i + 1) * 20, "report progress");
    }

    ctx.set_result(json!({
        "report_id": report_id,
        "url": format!("https://example.com/reports/{}.pdf", report_id),
    }));
    Ok(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ojs_worker::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let worker = Worker::builder()
        .url("http://localhost:8080")
        .queues(vec!["default", "email", "reports"])
        .concurrency(10)
        .grace_period(Duration::from_secs(30))
        .poll_interval(Duration::from_secs(1))
        .labels(vec!["demo"])
        .build()?;

    let metrics = MetricsMiddleware::new();

    // Outermost first.
    worker.use_middleware("logging", LoggingMiddleware::new());
    worker.use_middleware("metrics", metrics.clone());
    worker.use_middleware("tenant", TenantMiddleware);
    worker.use_middleware(
        "retry",
        RetryMiddleware::builder().max_retries(2).build(),
    );
    worker.use_middleware("timeout", TimeoutMiddleware::new(Duration::from_secs(30)));

    worker.register("email.send", handle_email_send)?;
    worker.register("report.generate", handle_report_generate)?;
    worker.register("notification.push", |ctx: JobContext| async move {
        let user_id: u64 = ctx.job.arg("user_id")?;
        let message: String = ctx.job.arg("message")?;
        tracing::info!(user_id, %message, "pushing notification");
        Ok(json!({"delivered": true}))
    })?;

    tracing::info!(worker_id = worker.id(), "worker starting, press Ctrl+C to stop");

    // Blocks until Ctrl+C, stop(), or a terminate directive.
    worker.start().await?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        completed = snapshot.total_completed,
        failed = snapshot.total_failed,
        "worker stopped gracefully"
    );
    Ok(())
}
