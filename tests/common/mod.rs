#![allow(dead_code)]

use ojs_worker::transport::{Method, Transport, TransportFuture};
use ojs_worker::{OjsError, ServerError, Worker};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

/// In-memory OJS server: hands out queued jobs on fetch, answers worker
/// heartbeats from a script, and records every call.
#[derive(Debug, Default)]
pub struct MockTransport {
    jobs: Mutex<VecDeque<Value>>,
    heartbeat_replies: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<Call>>,
    failing_fetches: AtomicUsize,
    failing_heartbeats: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_job(&self, job: Value) {
        self.jobs.lock().unwrap().push_back(job);
    }

    /// Reply used for the next worker heartbeat; `{}` once the script runs out.
    pub fn push_heartbeat_reply(&self, reply: Value) {
        self.heartbeat_replies.lock().unwrap().push_back(reply);
    }

    /// Make the next `n` fetch calls fail with a transport error.
    pub fn fail_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` worker heartbeats fail with a transport error.
    pub fn fail_heartbeats(&self, n: usize) {
        self.failing_heartbeats.store(n, Ordering::SeqCst);
    }

    /// Hold every fetch reply for `delay`. Jobs are taken off the queue
    /// when the request arrives, as a server leases them.
    pub fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bodies(&self, path: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .map(|c| c.body)
            .collect()
    }

    pub fn acks(&self) -> Vec<Value> {
        self.bodies("/workers/ack")
    }

    pub fn nacks(&self) -> Vec<Value> {
        self.bodies("/workers/nack")
    }

    pub fn fetch_count(&self) -> usize {
        self.bodies("/workers/fetch").len()
    }

    /// Heartbeats sent by the worker loop (not per-job lease extensions).
    pub fn worker_heartbeats(&self) -> Vec<Value> {
        self.bodies("/workers/heartbeat")
            .into_iter()
            .filter(|b| b.get("job_id").is_none())
            .collect()
    }

    fn respond(&self, path: &str, body: &Value) -> ojs_worker::Result<Value> {
        match path {
            "/workers/fetch" => {
                if take_one(&self.failing_fetches) {
                    return Err(OjsError::Transport("connection refused".into()));
                }
                let count = body["count"].as_u64().unwrap_or(1) as usize;
                let mut queue = self.jobs.lock().unwrap();
                let n = count.min(queue.len());
                let jobs: Vec<Value> = queue.drain(..n).collect();
                Ok(json!({ "jobs": jobs }))
            }
            "/workers/heartbeat" if body.get("job_id").is_some() => Ok(json!({})),
            "/workers/heartbeat" if take_one(&self.failing_heartbeats) => {
                Err(OjsError::Transport("connection reset".into()))
            }
            "/workers/heartbeat" => Ok(self
                .heartbeat_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({}))),
            "/workers/ack" | "/workers/nack" => Ok(json!({})),
            other => Err(ServerError::new("not_found", format!("no route {}", other), 404).into()),
        }
    }
}

impl Transport for MockTransport {
    fn request(&self, method: Method, path: &str, body: Option<Value>) -> TransportFuture<'_> {
        let body = body.unwrap_or(Value::Null);
        self.calls.lock().unwrap().push(Call {
            method,
            path: path.to_string(),
            body: body.clone(),
        });
        let delay = match path {
            "/workers/fetch" => *self.fetch_delay.lock().unwrap(),
            _ => None,
        };
        let reply = self.respond(path, &body);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
        })
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn job(id: &str, job_type: &str) -> Value {
    json!({
        "specversion": "1.0.0-rc.1",
        "id": id,
        "type": job_type,
        "queue": "default",
        "args": [{}],
        "state": "active",
        "attempt": 1
    })
}

/// A worker wired to `transport` with fast timings and no signal handling.
pub fn worker(transport: &Arc<MockTransport>, concurrency: usize) -> Worker {
    Worker::builder()
        .transport(transport.clone())
        .retry(ojs_worker::RetryConfig::disabled())
        .concurrency(concurrency)
        .poll_interval(Duration::from_millis(20))
        .heartbeat_interval(Duration::from_secs(60))
        .grace_period(Duration::from_secs(5))
        .handle_signals(false)
        .build()
        .unwrap()
}

pub fn spawn(worker: &Worker) -> tokio::task::JoinHandle<ojs_worker::Result<()>> {
    let worker = worker.clone();
    tokio::spawn(async move { worker.start().await })
}

/// Poll `condition` every 10ms until it holds; panics after 5s.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Stop `worker` and wait for `start()` to return.
pub async fn shutdown(
    worker: &Worker,
    handle: tokio::task::JoinHandle<ojs_worker::Result<()>>,
) -> ojs_worker::Result<()> {
    worker.stop();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("worker did not stop in time")
        .expect("worker task panicked")
}

pub async fn within<F: Future>(d: Duration, f: F) -> F::Output {
    tokio::time::timeout(d, f).await.expect("deadline exceeded")
}
