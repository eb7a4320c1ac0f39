use crate::config::ConnectionConfig;
use crate::errors::OjsError;
use crate::job::Job;
use crate::queue::{
    CronJob, CronJobRequest, CronJobsResponse, DeadLetterPage, JobsResponse, Queue, QueueStats,
    QueuesResponse,
};
use crate::transport::{self, DynTransport, RetryConfig, RetryableTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Client builder
// ---------------------------------------------------------------------------

/// Builder for constructing an OJS [`Client`].
pub struct ClientBuilder {
    connection: ConnectionConfig,
    transport: Option<DynTransport>,
    retry: RetryConfig,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            transport: None,
            retry: RetryConfig::default(),
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

    /// Use a custom transport instead of HTTP.
    pub fn transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Retry settings for every request. Defaults to [`RetryConfig::default`].
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.connection.timeout = Some(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> crate::Result<Client> {
        let delegate: DynTransport = match self.transport {
            Some(t) => t,
            #[cfg(feature = "reqwest-transport")]
            None => Arc::new(transport::HttpTransport::new(&self.connection)?),
            #[cfg(not(feature = "reqwest-transport"))]
            None => {
                return Err(OjsError::Builder(
                    "a transport is required when the reqwest-transport feature is disabled"
                        .into(),
                ))
            }
        };

        Ok(Client {
            transport: Arc::new(RetryableTransport::new(delegate, self.retry)),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A producer-side OJS client for enqueuing and inspecting jobs.
///
/// # Example
///
/// ```rust,no_run
/// use ojs_worker::Client;
/// use serde_json::json;
///
/// # async fn run() -> ojs_worker::Result<()> {
/// let client = Client::builder()
///     .url("http://localhost:8080")
///     .build()?;
///
/// let job = client
///     .enqueue("email.send", json!({"to": "user@example.com"}))
///     .await?;
/// println!("enqueued {}", job.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    transport: DynTransport,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Enqueue a job on the server's default queue.
    ///
    /// `args` is sent as an array: an array is kept as is, any other value
    /// becomes its single element.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        args: serde_json::Value,
    ) -> crate::Result<Job> {
        self.send_enqueue(job_type.into(), args, None).await
    }

    /// Enqueue a job on a specific queue.
    pub async fn enqueue_to(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        args: serde_json::Value,
    ) -> crate::Result<Job> {
        self.send_enqueue(job_type.into(), args, Some(queue.into()))
            .await
    }

    /// Enqueue several jobs in one request. The server creates all of them
    /// or none. An empty batch returns without contacting the server.
    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> crate::Result<Vec<Job>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(i) = jobs.iter().position(|j| j.job_type.trim().is_empty()) {
            return Err(OjsError::Validation(format!(
                "job type must not be empty (batch index {})",
                i
            )));
        }

        let req = BatchEnqueueRequest {
            jobs: jobs
                .into_iter()
                .map(|j| EnqueueRequest {
                    job_type: j.job_type,
                    args: normalize_args(j.args),
                    options: j.queue.map(|queue| EnqueueOptions { queue }),
                })
                .collect(),
        };
        let resp: JobsResponse =
            transport::transport_post(&self.transport, "/jobs/batch", &req).await?;
        Ok(resp.jobs)
    }

    async fn send_enqueue(
        &self,
        job_type: String,
        args: serde_json::Value,
        queue: Option<String>,
    ) -> crate::Result<Job> {
        if job_type.trim().is_empty() {
            return Err(OjsError::Validation("job type must not be empty".into()));
        }

        let req = EnqueueRequest {
            job_type,
            args: normalize_args(args),
            options: queue.map(|queue| EnqueueOptions { queue }),
        };
        let resp: JobResponse = transport::transport_post(&self.transport, "/jobs", &req).await?;
        Ok(resp.into_job())
    }

    /// Get job details by ID.
    pub async fn get_job(&self, id: &str) -> crate::Result<Job> {
        let resp: JobResponse =
            transport::transport_get(&self.transport, &format!("/jobs/{}", id)).await?;
        Ok(resp.into_job())
    }

    /// Cancel a job by ID.
    pub async fn cancel_job(&self, id: &str) -> crate::Result<Job> {
        let resp: JobResponse =
            transport::transport_delete(&self.transport, &format!("/jobs/{}", id)).await?;
        Ok(resp.into_job())
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    pub async fn list_queues(&self) -> crate::Result<Vec<Queue>> {
        let resp: QueuesResponse = transport::transport_get(&self.transport, "/queues").await?;
        Ok(resp.queues)
    }

    pub async fn get_queue_stats(&self, name: &str) -> crate::Result<QueueStats> {
        transport::transport_get(&self.transport, &format!("/queues/{}/stats", name)).await
    }

    /// Stop the server handing out jobs from `name`.
    pub async fn pause_queue(&self, name: &str) -> crate::Result<()> {
        transport::transport_post_no_response(
            &self.transport,
            &format!("/queues/{}/pause", name),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn resume_queue(&self, name: &str) -> crate::Result<()> {
        transport::transport_post_no_response(
            &self.transport,
            &format!("/queues/{}/resume", name),
            &serde_json::json!({}),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Dead letter operations
    // -----------------------------------------------------------------------

    /// List dead-lettered jobs, optionally for one queue only.
    pub async fn list_dead_letter_jobs(
        &self,
        queue: Option<&str>,
        limit: u64,
        offset: u64,
    ) -> crate::Result<DeadLetterPage> {
        let mut path = format!("/dead-letter?limit={}&offset={}", limit, offset);
        if let Some(queue) = queue {
            path.push_str("&queue=");
            path.push_str(queue);
        }
        transport::transport_get(&self.transport, &path).await
    }

    /// Put a dead-lettered job back on its queue.
    pub async fn retry_dead_letter_job(&self, id: &str) -> crate::Result<Job> {
        let resp: JobResponse = transport::transport_post(
            &self.transport,
            &format!("/dead-letter/{}/retry", id),
            &serde_json::json!({}),
        )
        .await?;
        Ok(resp.into_job())
    }

    pub async fn discard_dead_letter_job(&self, id: &str) -> crate::Result<()> {
        transport::transport_delete_no_response(&self.transport, &format!("/dead-letter/{}", id))
            .await
    }

    // -----------------------------------------------------------------------
    // Cron operations
    // -----------------------------------------------------------------------

    pub async fn list_cron_jobs(&self) -> crate::Result<Vec<CronJob>> {
        let resp: CronJobsResponse = transport::transport_get(&self.transport, "/cron").await?;
        Ok(resp.cron_jobs)
    }

    pub async fn register_cron_job(&self, req: CronJobRequest) -> crate::Result<CronJob> {
        if req.job_type.trim().is_empty() {
            return Err(OjsError::Validation("job type must not be empty".into()));
        }
        let resp: CronJobResponse = transport::transport_post(&self.transport, "/cron", &req).await?;
        Ok(resp.into_cron_job())
    }

    pub async fn unregister_cron_job(&self, name: &str) -> crate::Result<()> {
        transport::transport_delete_no_response(&self.transport, &format!("/cron/{}", name)).await
    }

    // -----------------------------------------------------------------------
    // Server operations
    // -----------------------------------------------------------------------

    /// Check server health. The body is returned as sent.
    pub async fn health(&self) -> crate::Result<serde_json::Value> {
        transport::transport_get(&self.transport, "/health").await
    }

    /// The server's conformance manifest, served from `/ojs/manifest`
    /// outside the versioned API. The body is returned as sent.
    pub async fn manifest(&self) -> crate::Result<serde_json::Value> {
        transport::transport_get(&self.transport, MANIFEST_PATH).await
    }
}

const MANIFEST_PATH: &str = "/ojs/manifest";

/// One job of an [`Client::enqueue_batch`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub args: serde_json::Value,
    /// `None` leaves the choice to the server.
    pub queue: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
            queue: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Request body for POST /ojs/v1/jobs
#[derive(Debug, Serialize)]
struct EnqueueRequest {
    #[serde(rename = "type")]
    job_type: String,
    args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<EnqueueOptions>,
}

#[derive(Debug, Serialize)]
struct EnqueueOptions {
    queue: String,
}

/// Request body for POST /ojs/v1/jobs/batch
#[derive(Debug, Serialize)]
struct BatchEnqueueRequest {
    jobs: Vec<EnqueueRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CronJobResponse {
    Wrapped { cron_job: CronJob },
    Bare(CronJob),
}

impl CronJobResponse {
    fn into_cron_job(self) -> CronJob {
        match self {
            CronJobResponse::Wrapped { cron_job } | CronJobResponse::Bare(cron_job) => cron_job,
        }
    }
}

/// Servers answer either `{"job": {...}}` or the bare envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobResponse {
    Wrapped { job: Job },
    Bare(Job),
}

impl JobResponse {
    fn into_job(self) -> Job {
        match self {
            JobResponse::Wrapped { job } | JobResponse::Bare(job) => job,
        }
    }
}

fn normalize_args(args: serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Array(_) => args,
        other => serde_json::Value::Array(vec![other]),
    }
}
