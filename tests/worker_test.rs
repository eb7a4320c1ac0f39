mod common;

use common::{eventually, job, shutdown, spawn, worker, MockTransport};
use ojs_worker::{JobContext, OjsError, Worker, WorkerState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn explode() -> ojs_worker::HandlerResult {
    panic!("handler exploded")
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BoomError(String);

// ---------------------------------------------------------------------------
// Builder and registration
// ---------------------------------------------------------------------------

#[test]
fn test_worker_builder_requires_url() {
    let result = Worker::builder().build();
    assert!(result.is_err());
    let err = result.unwrap_err().to_string();
    assert!(err.contains("url is required"));
}

#[test]
fn test_worker_builder_with_defaults() {
    let worker = Worker::builder()
        .url("http://localhost:8080")
        .build()
        .unwrap();

    assert_eq!(worker.state(), WorkerState::Running);
    assert!(worker.id().starts_with("worker_"));
    assert_eq!(worker.active_job_count(), 0);
}

#[test]
fn test_worker_builder_with_all_options() {
    let worker = Worker::builder()
        .url("http://localhost:8080")
        .queues(vec!["email", "reports", "default"])
        .concurrency(20)
        .grace_period(Duration::from_secs(60))
        .heartbeat_interval(Duration::from_secs(10))
        .poll_interval(Duration::from_secs(2))
        .labels(vec!["region:us-east", "env:production"])
        .auth_token("worker-token")
        .header("X-Tenant", "acme")
        .timeout(Duration::from_secs(5))
        .handle_signals(false)
        .build();

    assert!(worker.is_ok());
}

#[test]
fn test_worker_builder_rejects_zero_concurrency() {
    let err = Worker::builder()
        .url("http://localhost:8080")
        .concurrency(0)
        .build()
        .unwrap_err();
    assert!(matches!(err, OjsError::Builder(_)));
}

#[test]
fn test_register_rejects_blank_type() {
    let transport = MockTransport::new();
    let worker = worker(&transport, 1);

    let err = worker
        .register("  ", |_ctx: JobContext| async { Ok(Value::Null) })
        .unwrap_err();
    assert!(matches!(err, OjsError::Validation(_)));
}

#[tokio::test]
async fn test_start_without_handlers_fails_before_any_call() {
    let transport = MockTransport::new();
    let worker = worker(&transport, 1);

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, OjsError::State(_)));
    assert!(transport.calls().is_empty());
}

#[test]
fn test_middleware_names_in_registration_order() {
    let transport = MockTransport::new();
    let worker = worker(&transport, 1);
    worker.use_middleware(
        "first",
        ojs_worker::FnMiddleware::new(|ctx: JobContext, next: ojs_worker::Next| next.run(ctx)),
    );
    worker.use_middleware(
        "second",
        ojs_worker::FnMiddleware::new(|ctx: JobContext, next: ojs_worker::Next| next.run(ctx)),
    );
    assert_eq!(worker.middleware_names(), vec!["first", "second"]);
}

// ---------------------------------------------------------------------------
// Dispatch outcomes
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ack_carries_handler_return_value() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.ok"));
    let worker = worker(&transport, 2);
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!("ok1")) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let acks = transport.acks();
    assert_eq!(acks[0], json!({"job_id": "j1", "result": "ok1"}));
    assert!(transport.nacks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ack_falls_back_to_context_result() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.slot"));
    let worker = worker(&transport, 2);
    worker
        .register("test.slot", |ctx: JobContext| async move {
            ctx.set_result(json!("X"));
            ctx.set_result(json!("Y"));
            Ok(Value::Null)
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    assert_eq!(transport.acks()[0]["result"], json!("Y"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_returned_value_beats_context_result() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.both"));
    let worker = worker(&transport, 1);
    worker
        .register("test.both", |ctx: JobContext| async move {
            ctx.set_result(json!("from-slot"));
            Ok(json!("from-return"))
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    assert_eq!(transport.acks()[0]["result"], json!("from-return"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ack_omits_absent_result() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.unit"));
    let worker = worker(&transport, 1);
    worker
        .register("test.unit", |_ctx: JobContext| async { Ok(Value::Null) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    assert_eq!(transport.acks()[0], json!({"job_id": "j1"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_error_nacks_with_error_class() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.fail"));
    let worker = worker(&transport, 1);
    worker
        .register("test.fail", |_ctx: JobContext| async {
            Err(OjsError::handler(BoomError("boom".into())))
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("nack", || transport.nacks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let nacks = transport.nacks();
    assert_eq!(nacks.len(), 1);
    assert_eq!(
        nacks[0],
        json!({
            "job_id": "j1",
            "error": {
                "code": "handler_error",
                "message": "boom",
                "retryable": true,
                "details": {"error_class": "BoomError"}
            }
        })
    );
    assert!(transport.acks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_retryable_error_nacks_without_retry() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.fatal"));
    let worker = worker(&transport, 1);
    worker
        .register("test.fatal", |_ctx: JobContext| async {
            Err(OjsError::non_retryable(BoomError("bad payload".into())))
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("nack", || transport.nacks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let error = &transport.nacks()[0]["error"];
    assert_eq!(error["code"], "handler_error");
    assert_eq!(error["retryable"], false);
    assert_eq!(error["message"], "bad payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_handler_nacks_handler_not_found() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "unknown.type"));
    let worker = worker(&transport, 1);

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    worker
        .register("known.type", move |_ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("nack", || transport.nacks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let nacks = transport.nacks();
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0]["job_id"], "j1");
    assert_eq!(nacks[0]["error"]["code"], "handler_not_found");
    assert_eq!(nacks[0]["error"]["retryable"], false);
    assert_eq!(nacks[0]["error"]["details"]["job_type"], "unknown.type");
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(transport.acks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_is_nacked_and_frees_its_slot() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.panic"));
    transport.push_job(job("j2", "test.ok"));
    let worker = worker(&transport, 1);
    worker
        .register("test.panic", |_ctx: JobContext| async { explode() })
        .unwrap();
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!("fine")) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("both outcomes", || {
        transport.nacks().len() == 1 && transport.acks().len() == 1
    })
    .await;
    shutdown(&worker, handle).await.unwrap();

    let nack = &transport.nacks()[0];
    assert_eq!(nack["job_id"], "j1");
    assert_eq!(nack["error"]["details"]["error_class"], "panic");
    assert_eq!(nack["error"]["message"], "handler exploded");
    assert_eq!(transport.acks()[0]["job_id"], "j2");
    assert_eq!(worker.active_job_count(), 0);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_jobs_never_exceed_concurrency() {
    const CONCURRENCY: usize = 3;
    const JOBS: usize = 12;

    let transport = MockTransport::new();
    for i in 0..JOBS {
        transport.push_job(job(&format!("j{}", i), "test.slow"));
    }
    let worker = worker(&transport, CONCURRENCY);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    worker
        .register("test.slow", move |_ctx: JobContext| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .unwrap();

    let handle = spawn(&worker);
    let observer = worker.clone();
    let sampled_peak = Arc::new(AtomicUsize::new(0));
    let sampled = sampled_peak.clone();
    let sampler = tokio::spawn(async move {
        loop {
            sampled.fetch_max(observer.active_job_count(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    eventually("all acks", || transport.acks().len() == JOBS).await;
    sampler.abort();
    shutdown(&worker, handle).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= CONCURRENCY);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert!(sampled_peak.load(Ordering::SeqCst) <= CONCURRENCY);
    for body in transport.bodies("/workers/fetch") {
        assert!(body["count"].as_u64().unwrap() as usize <= CONCURRENCY);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_slot_processes_jobs_one_at_a_time() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "type.one"));
    transport.push_job(job("j2", "type.two"));
    let worker = worker(&transport, 1);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for (job_type, result) in [("type.one", "ok1"), ("type.two", "ok2")] {
        let (running, peak) = (running.clone(), peak.clone());
        worker
            .register(job_type, move |_ctx: JobContext| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(result))
                }
            })
            .unwrap();
    }

    let handle = spawn(&worker);
    eventually("two acks", || transport.acks().len() == 2).await;
    shutdown(&worker, handle).await.unwrap();

    let mut results: Vec<(String, String)> = transport
        .acks()
        .iter()
        .map(|a| {
            (
                a["job_id"].as_str().unwrap().to_string(),
                a["result"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    results.sort();
    assert_eq!(
        results,
        vec![
            ("j1".to_string(), "ok1".to_string()),
            ("j2".to_string(), "ok2".to_string())
        ]
    );
    assert!(transport.nacks().is_empty());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_errors_do_not_stop_the_loop() {
    let transport = MockTransport::new();
    transport.fail_fetches(3);
    transport.push_job(job("j1", "test.ok"));
    let worker = worker(&transport, 1);
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!(true)) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack after failures", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    assert!(transport.fetch_count() >= 4);
}

// ---------------------------------------------------------------------------
// Heartbeats and lifecycle
// ---------------------------------------------------------------------------

fn heartbeat_worker(transport: &Arc<MockTransport>) -> Worker {
    Worker::builder()
        .transport(transport.clone())
        .retry(ojs_worker::RetryConfig::disabled())
        .queues(vec!["default", "email"])
        .labels(vec!["env:test"])
        .concurrency(4)
        .poll_interval(Duration::from_millis(20))
        .heartbeat_interval(Duration::from_millis(30))
        .grace_period(Duration::from_secs(1))
        .handle_signals(false)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_reports_worker_status() {
    let transport = MockTransport::new();
    let worker = heartbeat_worker(&transport);
    worker
        .register("noop", |_ctx: JobContext| async { Ok(Value::Null) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("a heartbeat", || !transport.worker_heartbeats().is_empty()).await;
    shutdown(&worker, handle).await.unwrap();

    let beat = &transport.worker_heartbeats()[0];
    assert_eq!(beat["worker_id"], worker.id());
    assert_eq!(beat["state"], "running");
    assert_eq!(beat["active_jobs"], 0);
    assert_eq!(beat["active_job_ids"], json!([]));
    assert_eq!(beat["queues"], json!(["default", "email"]));
    assert_eq!(beat["concurrency"], 4);
    assert_eq!(beat["labels"], json!(["env:test"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quiet_directive_stops_fetching_and_is_idempotent() {
    let transport = MockTransport::new();
    transport.push_heartbeat_reply(json!({"state": "quiet"}));
    transport.push_heartbeat_reply(json!({"state": "quiet"}));
    let worker = heartbeat_worker(&transport);
    worker
        .register("noop", |_ctx: JobContext| async { Ok(Value::Null) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("quiet", || worker.state() == WorkerState::Quiet).await;
    eventually("second quiet reply consumed", || {
        transport.worker_heartbeats().len() >= 3
    })
    .await;
    assert_eq!(worker.state(), WorkerState::Quiet);
    assert!(!handle.is_finished());

    // Quiet keeps heartbeating but no longer fetches.
    let fetches = transport.fetch_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.fetch_count(), fetches);
    assert!(transport
        .worker_heartbeats()
        .iter()
        .skip(1)
        .all(|b| b["state"] == "quiet"));

    shutdown(&worker, handle).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Terminate);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_directive_stops_the_worker() {
    let transport = MockTransport::new();
    transport.push_heartbeat_reply(json!({"state": "terminate"}));
    let worker = heartbeat_worker(&transport);
    worker
        .register("noop", |_ctx: JobContext| async { Ok(Value::Null) })
        .unwrap();

    let result = common::within(Duration::from_secs(5), worker.start()).await;
    assert!(result.is_ok());
    assert_eq!(worker.state(), WorkerState::Terminate);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_active_jobs() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.slow"));
    let worker = worker(&transport, 1);
    worker
        .register("test.slow", |_ctx: JobContext| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("late"))
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("job running", || worker.active_job_count() == 1).await;
    assert_eq!(worker.active_job_ids(), vec!["j1".to_string()]);

    worker.stop();
    worker.stop();
    assert_eq!(worker.state(), WorkerState::Quiet);

    common::within(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.acks().len(), 1);
    assert_eq!(worker.active_job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_grace_period_abandons_long_jobs() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.forever"));
    let worker = Worker::builder()
        .transport(transport.clone())
        .retry(ojs_worker::RetryConfig::disabled())
        .concurrency(1)
        .poll_interval(Duration::from_millis(20))
        .grace_period(Duration::from_millis(100))
        .handle_signals(false)
        .build()
        .unwrap();
    worker
        .register("test.forever", |_ctx: JobContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("job running", || worker.active_job_count() == 1).await;

    let started = std::time::Instant::now();
    common::shutdown(&worker, handle).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(worker.state(), WorkerState::Terminate);
    assert!(transport.acks().is_empty());
    assert!(transport.nacks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_heartbeat_extends_lease() {
    let transport = MockTransport::new();
    transport.push_job(job("j1", "test.long"));
    let worker = worker(&transport, 1);
    worker
        .register("test.long", |ctx: JobContext| async move {
            ctx.heartbeat().await?;
            Ok(Value::Null)
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let lease_calls: Vec<Value> = transport
        .bodies("/workers/heartbeat")
        .into_iter()
        .filter(|b| b.get("job_id").is_some())
        .collect();
    assert_eq!(
        lease_calls,
        vec![json!({"worker_id": worker.id(), "job_id": "j1"})]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_envelope_is_nacked_without_retry() {
    let transport = MockTransport::new();
    transport.push_job(json!({"id": "bad", "type": ""}));
    transport.push_job(json!({"type": "test.ok"}));
    transport.push_job(job("good", "test.ok"));
    let worker = worker(&transport, 3);
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!(1)) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack and nack", || {
        transport.acks().len() == 1 && transport.nacks().len() == 1
    })
    .await;
    shutdown(&worker, handle).await.unwrap();

    assert_eq!(transport.acks()[0]["job_id"], "good");
    let nack = &transport.nacks()[0];
    assert_eq!(nack["job_id"], "bad");
    assert_eq!(nack["error"]["code"], "invalid_payload");
    assert_eq!(nack["error"]["retryable"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_null_queue_and_specversion_are_defaulted_and_acked() {
    let transport = MockTransport::new();
    transport.push_job(json!({
        "specversion": null,
        "id": "j1",
        "type": "test.queue",
        "queue": null,
        "args": null,
        "error": {"type": null, "message": null}
    }));
    let worker = worker(&transport, 1);
    worker
        .register("test.queue", |ctx: JobContext| async move {
            Ok(json!({"queue": ctx.queue(), "version": ctx.job.specversion}))
        })
        .unwrap();

    let handle = spawn(&worker);
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let ack = &transport.acks()[0];
    assert_eq!(ack["job_id"], "j1");
    assert_eq!(ack["result"], json!({"queue": "default", "version": "1.0.0-rc.1"}));
    assert!(transport.nacks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_in_flight_at_stop_still_dispatches_its_jobs() {
    let transport = MockTransport::new();
    transport.delay_fetches(Duration::from_millis(300));
    transport.push_job(job("late", "test.ok"));
    let worker = worker(&transport, 2);
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!("done")) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("fetch issued", || transport.fetch_count() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    let acks = transport.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["job_id"], "late");
    assert_eq!(transport.fetch_count(), 1);
    assert_eq!(worker.active_job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_failures_do_not_stop_the_worker() {
    let transport = MockTransport::new();
    transport.fail_heartbeats(3);
    let worker = heartbeat_worker(&transport);
    worker
        .register("test.ok", |_ctx: JobContext| async { Ok(json!(1)) })
        .unwrap();

    let handle = spawn(&worker);
    eventually("heartbeats past the failures", || {
        transport.worker_heartbeats().len() >= 5
    })
    .await;
    assert_eq!(worker.state(), WorkerState::Running);

    transport.push_job(job("after", "test.ok"));
    eventually("ack", || transport.acks().len() == 1).await;
    shutdown(&worker, handle).await.unwrap();

    assert_eq!(transport.acks()[0]["job_id"], "after");
}
