//! Wire types for the producer-side admin endpoints: queues, dead letters
//! and cron registrations.

use crate::job::{null_as_default, Job};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named job queue as listed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    /// `"active"` or `"paused"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Queue {
    pub fn is_paused(&self) -> bool {
        self.status.as_deref() == Some("paused")
    }
}

/// Counters for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stats: QueueCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

/// Per-state job counts and throughput figures. Fields the server omits
/// read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub available: u64,
    pub active: u64,
    pub scheduled: u64,
    pub retryable: u64,
    pub discarded: u64,
    pub completed_last_hour: u64,
    pub failed_last_hour: u64,
    pub avg_duration_ms: f64,
    pub avg_wait_ms: f64,
    pub throughput_per_second: f64,
}

/// Pagination metadata for list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    #[serde(default)]
    pub has_more: bool,
}

/// One page of dead-lettered jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// What the scheduler does when a cron tick fires while the previous run is
/// still going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Allow,
    CancelPrevious,
}

/// A cron registration as stored by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Body for registering a cron job.
///
/// ```rust
/// use ojs_worker::queue::CronJobRequest;
/// use serde_json::json;
///
/// let req = CronJobRequest::new("nightly-report", "0 2 * * *", "report.generate")
///     .timezone("Europe/Berlin")
///     .args(json!({"scope": "daily"}));
/// assert_eq!(req.args, vec![json!({"scope": "daily"})]);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct CronJobRequest {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub args: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, serde_json::Value>,
    pub overlap_policy: OverlapPolicy,
    pub enabled: bool,
}

impl CronJobRequest {
    /// A UTC registration with no args that skips overlapping runs.
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            timezone: default_timezone(),
            job_type: job_type.into(),
            args: Vec::new(),
            meta: HashMap::new(),
            overlap_policy: OverlapPolicy::default(),
            enabled: true,
        }
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    /// Same array normalisation as enqueue: a non-array value becomes the
    /// single element.
    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = match args {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueuesResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub queues: Vec<Queue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CronJobsResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub cron_jobs: Vec<CronJob>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobsResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub jobs: Vec<Job>,
}
