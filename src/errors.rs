use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error codes (from OJS HTTP spec)
// ---------------------------------------------------------------------------

pub const ERR_HANDLER_ERROR: &str = "handler_error";
pub const ERR_HANDLER_NOT_FOUND: &str = "handler_not_found";
pub const ERR_TIMEOUT: &str = "timeout";
pub const ERR_CANCELLED: &str = "cancelled";
pub const ERR_INVALID_REQUEST: &str = "invalid_request";
pub const ERR_INVALID_PAYLOAD: &str = "invalid_payload";
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_CONFLICT: &str = "conflict";
pub const ERR_DUPLICATE: &str = "duplicate";
pub const ERR_RATE_LIMITED: &str = "rate_limited";
pub const ERR_BACKEND_ERROR: &str = "backend_error";
pub const ERR_TRANSPORT_ERROR: &str = "transport_error";

// ---------------------------------------------------------------------------
// Main SDK error type
// ---------------------------------------------------------------------------

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum OjsError {
    /// Client-side validation failure (blank job type, bad retry policy, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Network or connection failure talking to the OJS server.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error returned by the OJS server.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// A handler failed while processing a job. The job may be retried.
    #[error("handler error: {0}")]
    Handler(HandlerError),

    /// A handler failed and asked for the job not to be retried.
    #[error("non-retryable error: {0}")]
    NonRetryable(HandlerError),

    /// No handler registered for the given job type.
    #[error("no handler registered for job type: {0}")]
    HandlerNotFound(String),

    /// A job did not finish within the time allowed by the timeout middleware.
    #[error("job {job_type} (id={job_id}) timed out after {}ms", .duration.as_millis())]
    Timeout {
        job_type: String,
        job_id: String,
        duration: Duration,
    },

    /// Operation not allowed in the worker's current state.
    #[error("state error: {0}")]
    State(String),

    /// Serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Builder misconfiguration.
    #[error("builder error: {0}")]
    Builder(String),
}

impl OjsError {
    /// Wrap an arbitrary error raised by a job handler.
    ///
    /// The concrete type name of `err` is recorded as the error class and
    /// reported to the server in the nack details.
    pub fn handler<E: std::error::Error>(err: E) -> Self {
        OjsError::Handler(HandlerError::from_error(&err))
    }

    /// A handler failure described only by a message.
    pub fn handler_message(message: impl Into<String>) -> Self {
        OjsError::Handler(HandlerError::new("HandlerError", message))
    }

    /// Wrap a handler error that should not be retried by the server.
    pub fn non_retryable<E: std::error::Error>(err: E) -> Self {
        OjsError::NonRetryable(HandlerError::from_error(&err))
    }

    /// Returns `true` if the failed operation may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            OjsError::Transport(_) | OjsError::Handler(_) | OjsError::Timeout { .. } => true,
            OjsError::Server(e) => e.retryable,
            _ => false,
        }
    }

    /// The class name reported as `details.error_class` when a job is nack'd.
    pub fn error_class(&self) -> &str {
        match self {
            OjsError::Handler(e) | OjsError::NonRetryable(e) => &e.error_class,
            OjsError::Validation(_) => "ValidationError",
            OjsError::Transport(_) => "TransportError",
            OjsError::Server(_) => "ApiError",
            OjsError::HandlerNotFound(_) => "HandlerNotFoundError",
            OjsError::Timeout { .. } => "TimeoutError",
            OjsError::State(_) => "StateError",
            OjsError::Serialization(_) => "SerializationError",
            OjsError::Builder(_) => "BuilderError",
        }
    }

    /// The bare message, without the variant prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            OjsError::Handler(e) | OjsError::NonRetryable(e) => e.message.clone(),
            OjsError::Server(e) => e.message.clone(),
            OjsError::Validation(m)
            | OjsError::Transport(m)
            | OjsError::State(m)
            | OjsError::Serialization(m)
            | OjsError::Builder(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ServerError> for OjsError {
    fn from(err: ServerError) -> Self {
        OjsError::Server(Box::new(err))
    }
}

#[cfg(feature = "reqwest-transport")]
impl From<reqwest::Error> for OjsError {
    fn from(err: reqwest::Error) -> Self {
        OjsError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for OjsError {
    fn from(err: serde_json::Error) -> Self {
        OjsError::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handler error
// ---------------------------------------------------------------------------

/// A failure raised by a job handler, with the name of the error type that
/// caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub error_class: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(error_class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_class: error_class.into(),
            message: message.into(),
        }
    }

    /// Capture the message and short type name of `err`.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self {
            error_class: short_type_name::<E>(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// `my_crate::jobs::SendError<T>` -> `SendError`
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

// ---------------------------------------------------------------------------
// Server error (structured error from OJS backend)
// ---------------------------------------------------------------------------

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip)]
    pub http_status: u16,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref id) = self.request_id {
            write!(f, " (request_id={})", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

impl ServerError {
    /// Create a new server error. Retryability defaults from the HTTP status:
    /// 429 and 5xx are retryable, everything else is not.
    pub fn new(code: impl Into<String>, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: status_is_retryable(http_status),
            details: None,
            request_id: None,
            http_status,
        }
    }

    /// Set whether this error is retryable.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Returns `true` if this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Returns the machine-readable error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ERR_NOT_FOUND || self.http_status == 404
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ERR_CONFLICT || self.http_status == 409
    }

    pub fn is_duplicate(&self) -> bool {
        self.code == ERR_DUPLICATE
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code == ERR_RATE_LIMITED || self.http_status == 429
    }
}

pub(crate) fn status_is_retryable(status: u16) -> bool {
    status == 429 || status >= 500
}

// ---------------------------------------------------------------------------
// Wire format for parsing server error responses
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ServerErrorPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerErrorPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

impl ServerErrorPayload {
    pub fn into_server_error(
        self,
        http_status: u16,
        request_id: Option<String>,
        raw_body: &str,
    ) -> ServerError {
        ServerError {
            code: self.code.unwrap_or_else(|| "unknown".to_string()),
            message: self.message.unwrap_or_else(|| raw_body.to_string()),
            retryable: self.retryable,
            details: self.details,
            request_id,
            http_status,
        }
    }
}

// ---------------------------------------------------------------------------
// Job-level error (attached to failed jobs)
// ---------------------------------------------------------------------------

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error type / class name.
    #[serde(
        rename = "type",
        default = "default_error_type",
        deserialize_with = "error_type_or_default"
    )]
    pub error_type: String,
    /// Human-readable error description.
    #[serde(default, deserialize_with = "crate::job::null_as_default")]
    pub message: String,
    /// Optional stack trace frames.
    #[serde(
        default,
        deserialize_with = "crate::job::null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub backtrace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

fn default_error_type() -> String {
    "unknown".to_string()
}

fn error_type_or_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_error_type))
}

// ---------------------------------------------------------------------------
// Result type alias
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, OjsError>;
