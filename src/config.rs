use std::collections::HashMap;
use std::time::Duration;

/// Connection settings shared by a [`Client`](crate::Client) and a
/// [`Worker`](crate::Worker) talking to the same OJS server.
///
/// # Example
///
/// ```rust
/// use ojs_worker::ConnectionConfig;
///
/// let config = ConnectionConfig::new("http://localhost:8080")
///     .auth_token("my-token")
///     .header("X-Tenant-Id", "tenant-42")
///     .timeout(std::time::Duration::from_secs(10));
///
/// let client = ojs_worker::Client::builder()
///     .connection(config.clone())
///     .build()
///     .unwrap();
///
/// let worker = ojs_worker::Worker::builder()
///     .connection(config)
///     .queues(vec!["default"])
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// OJS server URL, without the `/ojs/v1` base path.
    pub url: String,
    /// Bearer token sent as `Authorization`.
    pub auth_token: Option<String>,
    /// Extra headers added to every request.
    pub headers: HashMap<String, String>,
    /// Per-request timeout. `None` leaves the HTTP client's default.
    pub timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }
}
