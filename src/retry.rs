use crate::errors::OjsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Retry policy configuration for failed jobs.
///
/// Follows the OJS retry specification. The server applies the policy; the
/// SDK only carries it on the job envelope. Construct one through
/// [`RetryPolicy::builder`], which validates the values.
///
/// On the wire, intervals are expressed in milliseconds
/// (`initial_interval_ms`, `max_interval_ms`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicyWire", into = "RetryPolicyWire")]
pub struct RetryPolicy {
    /// Total number of attempts including the initial execution.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each attempt. Always >= 1.0.
    pub backoff_coefficient: f64,
    /// Upper bound for the delay between attempts.
    pub max_interval: Duration,
    /// Whether the server randomizes delays to avoid thundering herds.
    pub jitter: bool,
    /// Error type names that are never retried.
    pub non_retryable_errors: BTreeSet<String>,
    /// Action when all retry attempts are exhausted.
    pub on_exhaustion: OnExhaustion,
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s initial interval, x2 backoff, 5m cap, jitter on, discard.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(300),
            jitter: true,
            non_retryable_errors: BTreeSet::new(),
            on_exhaustion: OnExhaustion::Discard,
        }
    }
}

impl RetryPolicy {
    /// Start building a policy from the defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: RetryPolicy::default(),
        }
    }

    /// Returns `true` if `error_type` is listed as non-retryable.
    pub fn is_non_retryable(&self, error_type: &str) -> bool {
        self.non_retryable_errors.contains(error_type)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.backoff_coefficient.is_nan() || self.backoff_coefficient < 1.0 {
            return Err(OjsError::Validation(format!(
                "backoff_coefficient must be >= 1.0, got {}",
                self.backoff_coefficient
            )));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`]. Unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.policy.max_attempts = n;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.policy.initial_interval = interval;
        self
    }

    pub fn backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.policy.backoff_coefficient = coefficient;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    pub fn non_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.non_retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_exhaustion(mut self, action: OnExhaustion) -> Self {
        self.policy.on_exhaustion = action;
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> crate::Result<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Action taken when all retry attempts are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhaustion {
    /// Discard the job (move to discarded state).
    #[default]
    Discard,
    /// Move the job to the dead letter queue.
    DeadLetter,
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Every field is optional on decode; missing and `null` both take the
/// default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RetryPolicyWire {
    #[serde(default)]
    max_attempts: Option<i64>,
    #[serde(default)]
    initial_interval_ms: Option<u64>,
    #[serde(default)]
    backoff_coefficient: Option<f64>,
    #[serde(default)]
    max_interval_ms: Option<u64>,
    #[serde(default)]
    jitter: Option<bool>,
    #[serde(default)]
    non_retryable_errors: Option<BTreeSet<String>>,
    #[serde(default)]
    on_exhaustion: Option<OnExhaustion>,
}

impl TryFrom<RetryPolicyWire> for RetryPolicy {
    type Error = OjsError;

    fn try_from(wire: RetryPolicyWire) -> crate::Result<Self> {
        let defaults = RetryPolicy::default();

        let max_attempts = match wire.max_attempts {
            None => defaults.max_attempts,
            Some(n) => u32::try_from(n).map_err(|_| {
                OjsError::Validation(format!("max_attempts must be >= 0, got {}", n))
            })?,
        };

        let policy = RetryPolicy {
            max_attempts,
            initial_interval: wire
                .initial_interval_ms
                .map_or(defaults.initial_interval, Duration::from_millis),
            backoff_coefficient: wire
                .backoff_coefficient
                .unwrap_or(defaults.backoff_coefficient),
            max_interval: wire
                .max_interval_ms
                .map_or(defaults.max_interval, Duration::from_millis),
            jitter: wire.jitter.unwrap_or(defaults.jitter),
            non_retryable_errors: wire.non_retryable_errors.unwrap_or_default(),
            on_exhaustion: wire.on_exhaustion.unwrap_or(defaults.on_exhaustion),
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl From<RetryPolicy> for RetryPolicyWire {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: Some(i64::from(policy.max_attempts)),
            initial_interval_ms: Some(policy.initial_interval.as_millis() as u64),
            backoff_coefficient: Some(policy.backoff_coefficient),
            max_interval_ms: Some(policy.max_interval.as_millis() as u64),
            jitter: Some(policy.jitter),
            non_retryable_errors: Some(policy.non_retryable_errors),
            on_exhaustion: Some(policy.on_exhaustion),
        }
    }
}
