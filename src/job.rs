use crate::errors::{JobError, OjsError};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Spec version stamped on envelopes that do not carry one.
pub const SPEC_VERSION: &str = "1.0.0-rc.1";

// ---------------------------------------------------------------------------
// Job State
// ---------------------------------------------------------------------------

/// The lifecycle state of a job. Transitions happen server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Scheduled for future execution at `scheduled_at`.
    Scheduled,
    /// Ready to be fetched by a worker.
    Available,
    /// Staged for future activation (external trigger needed).
    Pending,
    /// Currently being processed by a worker.
    Active,
    /// Successfully completed.
    Completed,
    /// Failed but eligible for retry.
    Retryable,
    /// Explicitly cancelled.
    Cancelled,
    /// All retries exhausted, permanently failed.
    Discarded,
}

impl JobState {
    /// Returns `true` if this is a terminal state (completed, cancelled, or discarded).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Discarded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Cancelled => "cancelled",
            JobState::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job envelope conforming to the OJS specification.
///
/// `job_type` is never empty and `queue`/`specversion` always hold a value:
/// decoding fills the defaults and rejects a blank type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// OJS specification version.
    #[serde(default = "default_specversion", deserialize_with = "specversion_or_default")]
    pub specversion: String,

    /// Unique job identifier.
    pub id: String,

    /// Dot-namespaced job type (e.g., `email.send`).
    #[serde(rename = "type", deserialize_with = "non_blank_job_type")]
    pub job_type: String,

    /// Target queue name.
    #[serde(default = "default_queue", deserialize_with = "queue_or_default")]
    pub queue: String,

    /// Positional job arguments.
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<serde_json::Value>,

    /// Extensible metadata.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub meta: HashMap<String, serde_json::Value>,

    /// Job priority (higher = more urgent).
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: i32,

    /// Execution timeout in milliseconds.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Time for delayed execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Deadline; the job is discarded if not started by this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Retry policy configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Schema URI for args validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    // ---- System-managed fields (read-only) ----
    /// Current lifecycle state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,

    /// Current attempt number (0 = never executed).
    #[serde(default, deserialize_with = "null_as_default")]
    pub attempt: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// Return value from successful execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Tags for filtering.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,
}

impl Job {
    /// Create a bare envelope with the given id and type; all other fields
    /// take their defaults.
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> crate::Result<Self> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(OjsError::Validation("job type must not be empty".into()));
        }

        Ok(Self {
            specversion: default_specversion(),
            id: id.into(),
            job_type,
            queue: default_queue(),
            args: Vec::new(),
            meta: HashMap::new(),
            priority: 0,
            timeout_ms: None,
            scheduled_at: None,
            expires_at: None,
            retry: None,
            schema: None,
            state: None,
            attempt: 0,
            created_at: None,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            tags: Vec::new(),
        })
    }

    /// Set the queue, keeping the `default` fallback for blank names.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        if !queue.trim().is_empty() {
            self.queue = queue;
        }
        self
    }

    /// Replace the positional arguments.
    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    /// The argument bag: the first element of `args` when it is an object.
    pub fn args_map(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self.args.as_slice() {
            [serde_json::Value::Object(map)] => Some(map),
            _ => None,
        }
    }

    /// Extract a typed argument from the argument bag by key.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, key: &str) -> crate::Result<T> {
        let obj = self.args_map().ok_or_else(|| {
            OjsError::handler_message("args is not a single-element array holding an object")
        })?;

        let value = obj
            .get(key)
            .ok_or_else(|| OjsError::handler_message(format!("missing argument: {}", key)))?;

        serde_json::from_value(value.clone()).map_err(|e| {
            OjsError::handler_message(format!("failed to deserialize arg '{}': {}", key, e))
        })
    }

    /// Deserialize the whole argument bag into `T`.
    ///
    /// A single-element `args` array is unwrapped first; anything else is
    /// decoded as the array itself.
    pub fn args_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        let value = match self.args.as_slice() {
            [single] => single.clone(),
            many => serde_json::Value::Array(many.to_vec()),
        };
        serde_json::from_value(value)
            .map_err(|e| OjsError::handler_message(format!("failed to deserialize args: {}", e)))
    }

    /// Returns `true` if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(|s| s.is_terminal())
    }

    /// Workflow this job belongs to, from `meta.workflow_id`.
    pub fn workflow_id(&self) -> Option<&str> {
        self.meta.get("workflow_id").and_then(|v| v.as_str())
    }
}

fn default_specversion() -> String {
    SPEC_VERSION.to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn specversion_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_specversion))
}

fn queue_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_queue))
}

fn non_blank_job_type<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let job_type = String::deserialize(deserializer)?;
    if job_type.trim().is_empty() {
        return Err(serde::de::Error::custom("job type must not be empty"));
    }
    Ok(job_type)
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Wire format types for the worker protocol
// ---------------------------------------------------------------------------

/// Request body for POST /ojs/v1/workers/fetch
#[derive(Debug, Serialize)]
pub(crate) struct FetchRequest<'a> {
    pub worker_id: &'a str,
    pub queues: &'a [String],
    pub count: usize,
}

/// Response body for POST /ojs/v1/workers/fetch
///
/// Jobs are kept undecoded so one malformed envelope does not discard the
/// rest of the batch.
#[derive(Debug, Deserialize)]
pub(crate) struct FetchResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub jobs: Vec<serde_json::Value>,
}

/// Request body for POST /ojs/v1/workers/ack
#[derive(Debug, Serialize)]
pub(crate) struct AckRequest<'a> {
    pub job_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Request body for POST /ojs/v1/workers/nack
#[derive(Debug, Serialize)]
pub(crate) struct NackRequest<'a> {
    pub job_id: &'a str,
    pub error: NackError,
}

#[derive(Debug, Serialize)]
pub(crate) struct NackError {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

/// Request body for the periodic POST /ojs/v1/workers/heartbeat
#[derive(Debug, Serialize)]
pub(crate) struct HeartbeatRequest<'a> {
    pub worker_id: &'a str,
    pub state: &'static str,
    pub active_jobs: usize,
    pub active_job_ids: Vec<String>,
    pub queues: &'a [String],
    pub concurrency: usize,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub labels: &'a [String],
}

/// Request body for a single job's lease extension
#[derive(Debug, Serialize)]
pub(crate) struct JobHeartbeatRequest<'a> {
    pub worker_id: &'a str,
    pub job_id: &'a str,
}

/// Response body for POST /ojs/v1/workers/heartbeat
#[derive(Debug, Default, Deserialize)]
pub(crate) struct HeartbeatResponse {
    #[serde(default)]
    pub state: Option<String>,
}
