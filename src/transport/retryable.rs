use crate::errors::OjsError;
use crate::transport::{DynTransport, Method, Transport, TransportFuture};
use rand::Rng;
use std::time::Duration;

/// Retry settings for [`RetryableTransport`].
///
/// # Example
///
/// ```rust
/// use ojs_worker::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_max_retries(5)
///     .with_initial_backoff(Duration::from_millis(100))
///     .with_max_backoff(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retry attempts after the initial request (default: 3). Zero disables retries.
    pub max_retries: u32,
    /// Base for the exponential backoff (default: 200ms).
    pub initial_backoff: Duration,
    /// Upper bound for a single delay (default: 10s).
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt per request.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `initial_backoff * 2^attempt` clamped to `max_backoff`, then jittered
    /// uniformly into `(clamped/2, clamped]`. A zero cap gives a zero delay.
    pub(crate) fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let max_ms = self.max_backoff.as_millis() as u64;
        let clamped_ms = exp_ms.min(max_ms);

        let half = clamped_ms / 2;
        let span = clamped_ms - half;
        let jitter = if span == 0 {
            0
        } else {
            rand::thread_rng().gen_range(1..=span)
        };

        Duration::from_millis(half + jitter)
    }
}

/// A [`Transport`] decorator that retries transient failures with
/// exponential backoff.
///
/// Only errors whose [`OjsError::is_retryable`] flag is set are retried;
/// everything else is returned after the first attempt.
#[derive(Debug, Clone)]
pub struct RetryableTransport {
    delegate: DynTransport,
    config: RetryConfig,
}

impl RetryableTransport {
    pub fn new(delegate: DynTransport, config: RetryConfig) -> Self {
        Self { delegate, config }
    }

    pub fn builder() -> RetryableTransportBuilder {
        RetryableTransportBuilder::default()
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> crate::Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            match self.delegate.request(method, path, body.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.config.max_retries => {
                    return Err(err)
                }
                Err(err) => {
                    let delay = self.config.compute_backoff(attempt);
                    tracing::debug!(
                        method = %method,
                        path = %path,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Transport for RetryableTransport {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> TransportFuture<'_> {
        let path = path.to_string();
        Box::pin(async move { self.execute(method, &path, body).await })
    }
}

/// Builder for [`RetryableTransport`].
#[derive(Debug, Default)]
pub struct RetryableTransportBuilder {
    delegate: Option<DynTransport>,
    config: RetryConfig,
}

impl RetryableTransportBuilder {
    /// The transport every attempt is sent through. Required.
    pub fn delegate(mut self, delegate: DynTransport) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.config.initial_backoff = d;
        self
    }

    pub fn max_backoff(mut self, d: Duration) -> Self {
        self.config.max_backoff = d;
        self
    }

    pub fn build(self) -> crate::Result<RetryableTransport> {
        let delegate = self
            .delegate
            .ok_or_else(|| OjsError::Builder("delegate transport is required".into()))?;
        Ok(RetryableTransport::new(delegate, self.config))
    }
}
