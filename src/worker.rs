use crate::config::ConnectionConfig;
use crate::errors::{OjsError, ERR_HANDLER_ERROR, ERR_HANDLER_NOT_FOUND, ERR_INVALID_PAYLOAD};
use crate::job::{
    AckRequest, FetchRequest, FetchResponse, HeartbeatRequest, HeartbeatResponse, Job,
    JobHeartbeatRequest, NackError, NackRequest,
};
use crate::middleware::{handler_fn, HandlerFn, HandlerResult, Middleware, MiddlewareChain};
use crate::transport::{self, DynTransport, RetryConfig, RetryableTransport};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// The lifecycle state of a worker.
///
/// States only move forward: `Running` → `Quiet` → `Terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerState {
    /// Normal operation, actively fetching and processing jobs.
    Running = 0,
    /// No longer fetching new jobs, finishing active ones.
    Quiet = 1,
    /// Shutting down.
    Terminate = 2,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::Quiet,
            _ => WorkerState::Terminate,
        }
    }

    /// Wire name used in heartbeats.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Quiet => "quiet",
            WorkerState::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// Context passed to job handler functions.
///
/// Contains the job being processed, workflow metadata, a result slot, and
/// a heartbeat bound to this job. Clones share the result slot and the
/// cancelled flag.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    /// Workflow ID if this job is part of a workflow.
    pub workflow_id: Option<String>,
    /// Results from upstream workflow steps.
    pub parent_results: Option<HashMap<String, serde_json::Value>>,

    result: Arc<Mutex<Option<serde_json::Value>>>,
    cancelled: Arc<AtomicBool>,
    lease: Option<JobHeartbeat>,
}

#[derive(Debug, Clone)]
struct JobHeartbeat {
    transport: DynTransport,
    worker_id: Arc<str>,
}

impl JobContext {
    /// A context that is not attached to a worker, for exercising handlers
    /// and middleware directly. [`heartbeat`](Self::heartbeat) fails with
    /// [`OjsError::State`].
    pub fn new(job: Job) -> Self {
        let workflow_id = job.workflow_id().map(str::to_string);
        let parent_results = job
            .meta
            .get("parent_results")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

        Self {
            job,
            workflow_id,
            parent_results,
            result: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
            lease: None,
        }
    }

    fn attached(job: Job, transport: DynTransport, worker_id: Arc<str>) -> Self {
        let mut ctx = Self::new(job);
        ctx.lease = Some(JobHeartbeat {
            transport,
            worker_id,
        });
        ctx
    }

    /// Attempt number reported by the server for this execution.
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// Queue the job was fetched from.
    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// Store a result to acknowledge with. Later calls overwrite earlier
    /// ones; a non-null value returned by the handler takes precedence.
    pub fn set_result(&self, value: serde_json::Value) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// The value last stored with [`set_result`](Self::set_result).
    pub fn result(&self) -> Option<serde_json::Value> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the job as cancelled. Advisory: handlers decide whether to check it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Send a heartbeat to extend the visibility timeout for this job.
    ///
    /// Call this periodically in long-running handlers to prevent the job
    /// from being considered stale and re-dispatched. Failures are logged
    /// and returned; the job keeps running either way.
    pub async fn heartbeat(&self) -> crate::Result<()> {
        let hb = self
            .lease
            .as_ref()
            .ok_or_else(|| OjsError::State("job context is not attached to a worker".into()))?;

        let req = JobHeartbeatRequest {
            worker_id: &hb.worker_id,
            job_id: &self.job.id,
        };
        let result =
            transport::transport_post_no_response(&hb.transport, "/workers/heartbeat", &req).await;

        if let Err(ref e) = result {
            tracing::warn!(
                worker_id = %hb.worker_id,
                ojs.job.id = %self.job.id,
                error = %e,
                "job heartbeat failed"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Worker builder
// ---------------------------------------------------------------------------

/// Builder for constructing an OJS [`Worker`].
pub struct WorkerBuilder {
    connection: ConnectionConfig,
    transport: Option<DynTransport>,
    retry: RetryConfig,
    queues: Vec<String>,
    concurrency: usize,
    grace_period: Duration,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    labels: Vec<String>,
    handle_signals: bool,
}

impl WorkerBuilder {
    fn new() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            transport: None,
            retry: RetryConfig::default(),
            queues: vec!["default".to_string()],
            concurrency: 10,
            grace_period: Duration::from_secs(25),
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            labels: Vec::new(),
            handle_signals: true,
        }
    }

    /// Set the OJS server URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.connection.url = url.into();
        self
    }

    /// Use shared connection settings.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Use a custom transport instead of HTTP. URL, auth, header and timeout
    /// settings are ignored when one is given.
    pub fn transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Retry settings for fetch, ack, nack and heartbeat calls.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Set the queues to fetch jobs from (priority order: left to right).
    pub fn queues(mut self, queues: Vec<impl Into<String>>) -> Self {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum number of concurrent jobs.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Set the grace period for shutdown (time to wait for active jobs).
    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// Set the poll interval for fetching new jobs. Also bounds how long the
    /// fetch loop waits for a free slot.
    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// Add labels to identify this worker.
    pub fn labels(mut self, labels: Vec<impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Set the authentication bearer token.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.connection.auth_token = Some(token.into());
        self
    }

    /// Add a custom HTTP header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection.headers.insert(key.into(), value.into());
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.connection.timeout = Some(timeout);
        self
    }

    /// Stop the worker on Ctrl-C. Defaults to `true`.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Build the worker.
    pub fn build(self) -> crate::Result<Worker> {
        if self.concurrency == 0 {
            return Err(OjsError::Builder("concurrency must be at least 1".into()));
        }
        if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(OjsError::Builder(
                "poll_interval and heartbeat_interval must be non-zero".into(),
            ));
        }

        let delegate = match self.transport {
            Some(t) => t,
            None => default_transport(&self.connection)?,
        };
        let transport: DynTransport = Arc::new(RetryableTransport::new(delegate, self.retry));
        let (shutdown, _) = watch::channel(false);

        Ok(Worker {
            inner: Arc::new(WorkerInner {
                transport,
                worker_id: generate_worker_id().into(),
                queues: self.queues,
                concurrency: self.concurrency,
                grace_period: self.grace_period,
                heartbeat_interval: self.heartbeat_interval,
                poll_interval: self.poll_interval,
                labels: self.labels,
                handle_signals: self.handle_signals,
                handlers: DashMap::new(),
                middleware: MiddlewareChain::new(),
                state: AtomicU8::new(WorkerState::Running as u8),
                active_count: AtomicUsize::new(0),
                active_jobs: DashSet::new(),
                shutdown,
            }),
        })
    }
}

#[cfg(feature = "reqwest-transport")]
fn default_transport(config: &ConnectionConfig) -> crate::Result<DynTransport> {
    Ok(Arc::new(transport::HttpTransport::new(config)?))
}

#[cfg(not(feature = "reqwest-transport"))]
fn default_transport(_config: &ConnectionConfig) -> crate::Result<DynTransport> {
    Err(OjsError::Builder(
        "a transport is required when the reqwest-transport feature is disabled".into(),
    ))
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// An OJS worker that fetches and processes jobs.
///
/// `Worker` is a cheap handle: clones control the same engine, so one clone
/// can run [`start`](Self::start) while another calls [`stop`](Self::stop).
///
/// # Example
///
/// ```rust,no_run
/// use ojs_worker::{JobContext, Worker};
/// use serde_json::json;
///
/// # async fn run() -> ojs_worker::Result<()> {
/// let worker = Worker::builder()
///     .url("http://localhost:8080")
///     .queues(vec!["default", "email"])
///     .concurrency(10)
///     .build()?;
///
/// worker.register("email.send", |ctx: JobContext| async move {
///     let to: String = ctx.job.arg("to")?;
///     Ok(json!({"status": "sent", "to": to}))
/// })?;
///
/// worker.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    transport: DynTransport,
    worker_id: Arc<str>,
    queues: Vec<String>,
    concurrency: usize,
    grace_period: Duration,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    labels: Vec<String>,
    handle_signals: bool,
    handlers: DashMap<String, HandlerFn>,
    middleware: MiddlewareChain,
    state: AtomicU8,
    active_count: AtomicUsize,
    active_jobs: DashSet<String>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.inner.worker_id)
            .field("queues", &self.inner.queues)
            .field("concurrency", &self.inner.concurrency)
            .field("state", &self.state())
            .finish()
    }
}

impl Worker {
    /// Create a new worker builder.
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    /// Register a handler for a job type.
    ///
    /// The handler receives a [`JobContext`] and should return a JSON value
    /// on success. Returning an `Err` will cause the job to be nack'd.
    /// Registering the same type again replaces the earlier handler.
    pub fn register<F, Fut>(&self, job_type: impl Into<String>, handler: F) -> crate::Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(OjsError::Validation("job type must not be empty".into()));
        }
        self.inner.handlers.insert(job_type, handler_fn(handler));
        Ok(())
    }

    /// Add middleware to the worker.
    ///
    /// Middleware wraps all job handlers and executes in registration order
    /// (first registered = outermost wrapper). Jobs already running keep the
    /// chain they started with.
    pub fn use_middleware(&self, name: impl Into<String>, mw: impl Middleware) {
        self.inner.middleware.add(name, mw);
    }

    /// Names of the registered middleware, outermost first.
    pub fn middleware_names(&self) -> Vec<String> {
        self.inner.middleware.names()
    }

    /// Get the current worker state.
    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    /// Get the worker ID.
    pub fn id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Number of jobs currently executing.
    pub fn active_job_count(&self) -> usize {
        self.inner.active_count.load(Ordering::SeqCst)
    }

    /// IDs of the jobs currently executing.
    pub fn active_job_ids(&self) -> Vec<String> {
        self.inner.active_job_ids()
    }

    /// Stop fetching and begin graceful shutdown. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Start the worker and begin processing jobs.
    ///
    /// Blocks until [`stop`](Self::stop) is called, the server sends a
    /// terminate directive, or (with signal handling on) Ctrl-C arrives.
    /// Shutdown stops fetching and waits up to the grace period for active
    /// jobs; jobs still running after that are abandoned, not cancelled.
    pub async fn start(&self) -> crate::Result<()> {
        if self.inner.handlers.is_empty() {
            return Err(OjsError::State(
                "no handlers registered; call register() before start()".into(),
            ));
        }

        let inner = &self.inner;
        tracing::info!(
            worker_id = %inner.worker_id,
            queues = ?inner.queues,
            concurrency = inner.concurrency,
            "worker starting"
        );

        let mut shutdown_rx = inner.shutdown.subscribe();
        let semaphore = Arc::new(Semaphore::new(inner.concurrency));

        // Dropping the sets aborts the loops, including when this future is
        // dropped before shutdown completes.
        let mut fetcher = JoinSet::new();
        fetcher.spawn(fetch_loop(inner.clone(), semaphore));
        let mut tasks = JoinSet::new();
        tasks.spawn(heartbeat_loop(inner.clone()));
        if inner.handle_signals {
            let inner = inner.clone();
            tasks.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!(worker_id = %inner.worker_id, "interrupt received, stopping");
                    inner.stop();
                }
            });
        }

        // The sender lives in `inner`, so this only returns once stop() runs.
        let _ = shutdown_rx.wait_for(|stopped| *stopped).await;

        tracing::info!(
            worker_id = %inner.worker_id,
            active_jobs = inner.active_count.load(Ordering::SeqCst),
            "worker shutting down, waiting for active jobs"
        );

        let grace_deadline = tokio::time::Instant::now() + inner.grace_period;

        // A fetch already in flight may return leased jobs; let the loop
        // dispatch them before counting what is still active.
        if tokio::time::timeout_at(grace_deadline, fetcher.join_next())
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %inner.worker_id,
                "fetch still in flight at grace deadline, abandoning it"
            );
            fetcher.abort_all();
        }

        loop {
            if inner.active_count.load(Ordering::SeqCst) == 0 {
                break;
            }

            if tokio::time::Instant::now() >= grace_deadline {
                tracing::warn!(
                    worker_id = %inner.worker_id,
                    remaining_jobs = inner.active_count.load(Ordering::SeqCst),
                    job_ids = ?inner.active_job_ids(),
                    "grace period expired, abandoning remaining jobs"
                );
                break;
            }

            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        inner.advance(WorkerState::Terminate);
        tasks.abort_all();

        tracing::info!(worker_id = %inner.worker_id, "worker stopped");
        Ok(())
    }
}

impl WorkerInner {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move forward to `to`; never moves back.
    fn advance(&self, to: WorkerState) -> WorkerState {
        WorkerState::from_u8(self.state.fetch_max(to as u8, Ordering::SeqCst))
    }

    fn stop(&self) {
        self.advance(WorkerState::Quiet);
        self.shutdown.send_replace(true);
    }

    fn terminate(&self) {
        self.advance(WorkerState::Terminate);
        self.shutdown.send_replace(true);
    }

    /// Sleep for `duration`, waking early once shutdown is signalled.
    async fn idle(&self, duration: Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
        }
    }

    fn active_job_ids(&self) -> Vec<String> {
        self.active_jobs.iter().map(|id| id.key().clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Worker protocol calls
    // -----------------------------------------------------------------------

    async fn fetch_jobs(&self, count: usize) -> crate::Result<Vec<Job>> {
        let req = FetchRequest {
            worker_id: &self.worker_id,
            queues: &self.queues,
            count,
        };

        let resp: FetchResponse =
            transport::transport_post(&self.transport, "/workers/fetch", &req).await?;

        let mut jobs = Vec::with_capacity(resp.jobs.len());
        for raw in resp.jobs {
            let id = raw.get("id").and_then(|v| v.as_str()).map(str::to_string);
            let err = match serde_json::from_value::<Job>(raw) {
                Ok(job) => {
                    jobs.push(job);
                    continue;
                }
                Err(e) => e,
            };

            tracing::warn!(
                worker_id = %self.worker_id,
                ojs.job.id = ?id,
                error = %err,
                "malformed job envelope"
            );
            // Without an id the lease can only expire.
            if let Some(id) = id {
                self.nack(
                    &id,
                    NackError {
                        code: ERR_INVALID_PAYLOAD,
                        message: format!("malformed job envelope: {}", err),
                        retryable: false,
                        details: None,
                    },
                )
                .await;
            }
        }
        Ok(jobs)
    }

    async fn send_heartbeat(&self) {
        let state = self.state();
        let req = HeartbeatRequest {
            worker_id: &self.worker_id,
            state: state.as_str(),
            active_jobs: self.active_count.load(Ordering::SeqCst),
            active_job_ids: self.active_job_ids(),
            queues: &self.queues,
            concurrency: self.concurrency,
            labels: &self.labels,
        };

        let resp: HeartbeatResponse =
            match transport::transport_post(&self.transport, "/workers/heartbeat", &req).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
                    return;
                }
            };

        match resp.state.as_deref() {
            Some("quiet") => {
                let previous = self.advance(WorkerState::Quiet);
                if previous == WorkerState::Running {
                    tracing::info!(worker_id = %self.worker_id, "server directed worker to quiet mode");
                }
            }
            Some("terminate") => {
                tracing::info!(worker_id = %self.worker_id, "server directed worker to terminate");
                self.terminate();
            }
            _ => {}
        }
    }

    async fn ack(&self, job_id: &str, result: Option<serde_json::Value>) {
        let req = AckRequest { job_id, result };
        if let Err(e) =
            transport::transport_post_no_response(&self.transport, "/workers/ack", &req).await
        {
            tracing::warn!(
                worker_id = %self.worker_id,
                ojs.job.id = %job_id,
                error = %e,
                "failed to ack job"
            );
        }
    }

    async fn nack(&self, job_id: &str, error: NackError) {
        let req = NackRequest { job_id, error };
        if let Err(e) =
            transport::transport_post_no_response(&self.transport, "/workers/nack", &req).await
        {
            tracing::warn!(
                worker_id = %self.worker_id,
                ojs.job.id = %job_id,
                error = %e,
                "failed to nack job"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Job processing
    // -----------------------------------------------------------------------

    async fn process(&self, job: Job) {
        let job_id = job.id.clone();
        let job_type = job.job_type.clone();

        tracing::debug!(
            worker_id = %self.worker_id,
            ojs.job.id = %job_id,
            ojs.job.r#type = %job_type,
            ojs.job.queue = %job.queue,
            ojs.job.attempt = job.attempt,
            "processing job"
        );

        let handler = self.handlers.get(&job_type).map(|h| h.value().clone());
        let Some(handler) = handler else {
            tracing::warn!(ojs.job.id = %job_id, ojs.job.r#type = %job_type, "no handler registered");
            let details = HashMap::from([("job_type".to_string(), job_type.clone().into())]);
            self.nack(
                &job_id,
                NackError {
                    code: ERR_HANDLER_NOT_FOUND,
                    message: OjsError::HandlerNotFound(job_type).to_string(),
                    retryable: false,
                    details: Some(details),
                },
            )
            .await;
            return;
        };

        let wrapped = self.middleware.wrap(handler);
        let ctx = JobContext::attached(job, self.transport.clone(), self.worker_id.clone());
        let result_slot = ctx.clone();

        // Own task so a panicking handler surfaces as a JoinError.
        let outcome = tokio::spawn(async move { wrapped(ctx).await }).await;

        match outcome {
            Ok(Ok(value)) => {
                let result = if value.is_null() {
                    result_slot.result()
                } else {
                    Some(value)
                };
                tracing::debug!(ojs.job.id = %job_id, "job completed");
                self.ack(&job_id, result).await;
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    ojs.job.id = %job_id,
                    ojs.job.r#type = %job_type,
                    error_class = err.error_class(),
                    error = %err.message(),
                    "job failed"
                );
                let retryable = !matches!(err, OjsError::NonRetryable(_));
                let details =
                    HashMap::from([("error_class".to_string(), err.error_class().into())]);
                self.nack(
                    &job_id,
                    NackError {
                        code: ERR_HANDLER_ERROR,
                        message: err.message(),
                        retryable,
                        details: Some(details),
                    },
                )
                .await;
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                tracing::error!(
                    ojs.job.id = %job_id,
                    ojs.job.r#type = %job_type,
                    panic = %message,
                    "job handler panicked"
                );
                let details = HashMap::from([("error_class".to_string(), "panic".into())]);
                self.nack(
                    &job_id,
                    NackError {
                        code: ERR_HANDLER_ERROR,
                        message,
                        retryable: true,
                        details: Some(details),
                    },
                )
                .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn fetch_loop(inner: Arc<WorkerInner>, semaphore: Arc<Semaphore>) {
    while inner.state() == WorkerState::Running {
        let first = match tokio::time::timeout(
            inner.poll_interval,
            semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return,
            Err(_elapsed) => continue,
        };

        if inner.state() != WorkerState::Running {
            break;
        }

        let mut permits = vec![first];
        while permits.len() < inner.concurrency {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        match inner.fetch_jobs(permits.len()).await {
            Ok(jobs) if jobs.is_empty() => {
                drop(permits);
                inner.idle(inner.poll_interval).await;
            }
            Ok(jobs) => {
                let requested = permits.len();
                let received = jobs.len();
                for job in jobs {
                    let Some(permit) = permits.pop() else {
                        tracing::warn!(
                            worker_id = %inner.worker_id,
                            requested,
                            received,
                            "server returned more jobs than requested, leaving the rest to lease expiry"
                        );
                        break;
                    };
                    dispatch(inner.clone(), job, permit);
                }
                // Unused permits go back to the pool here.
                drop(permits);
            }
            Err(e) => {
                tracing::warn!(worker_id = %inner.worker_id, error = %e, "failed to fetch jobs");
                drop(permits);
                inner.idle(inner.poll_interval).await;
            }
        }
    }

    tracing::debug!(worker_id = %inner.worker_id, state = %inner.state(), "fetch loop stopped");
}

async fn heartbeat_loop(inner: Arc<WorkerInner>) {
    let mut ticker = tokio::time::interval(inner.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        inner.send_heartbeat().await;
    }
}

/// Bookkeeping for one running job. Dropping it removes the job from the
/// active set and returns its permit, on every exit path including panics.
struct ActiveJob {
    inner: Arc<WorkerInner>,
    job_id: String,
    _permit: OwnedSemaphorePermit,
}

impl ActiveJob {
    fn begin(inner: Arc<WorkerInner>, job_id: String, permit: OwnedSemaphorePermit) -> Self {
        inner.active_jobs.insert(job_id.clone());
        inner.active_count.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            job_id,
            _permit: permit,
        }
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.inner.active_jobs.remove(&self.job_id);
        self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn dispatch(inner: Arc<WorkerInner>, job: Job, permit: OwnedSemaphorePermit) {
    let guard = ActiveJob::begin(inner.clone(), job.id.clone(), permit);
    tokio::spawn(async move {
        let _guard = guard;
        inner.process(job).await;
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn generate_worker_id() -> String {
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("worker_{}_{}", pid, nanos)
}
