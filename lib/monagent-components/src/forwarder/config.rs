use std::time::Duration;

use monagent_config::GenericConfiguration;
use monagent_error::GenericError;
use serde::Deserialize;

use super::ExponentialBackoff;

const fn default_request_timeout_secs() -> u64 {
    20
}

const fn default_flush_interval_secs() -> u64 {
    5
}

const fn default_max_queue_size_bytes() -> u64 {
    15 * 1024 * 1024
}

const fn default_max_retries() -> u32 {
    20
}

const fn default_max_transaction_age_secs() -> u64 {
    3600
}

const fn default_backlog_send_rate() -> usize {
    1000
}

const fn default_backoff_base_secs() -> f64 {
    2.0
}

const fn default_backoff_max_secs() -> f64 {
    64.0
}

const fn default_backoff_factor() -> f64 {
    2.0
}

/// Forwarder configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ForwarderConfiguration {
    /// URL batches are posted to.
    ///
    /// When unset, batches are logged and discarded.
    #[serde(rename = "forwarder_url", default)]
    url: Option<String>,

    /// Token sent in the `X-Auth-Token` header of every request.
    #[serde(rename = "forwarder_auth_token", default)]
    auth_token: Option<String>,

    /// Timeout for a single delivery attempt, in seconds.
    ///
    /// Defaults to 20 seconds.
    #[serde(rename = "forwarder_timeout", default = "default_request_timeout_secs")]
    request_timeout_secs: u64,

    /// How often the queue is flushed, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(rename = "forwarder_flush_interval", default = "default_flush_interval_secs")]
    flush_interval_secs: u64,

    /// Minimum time between two flush cycles that attempt delivery, in milliseconds.
    ///
    /// A flush requested sooner than this after the previous attempt is deferred to the next cycle.
    ///
    /// Defaults to 0.
    #[serde(rename = "forwarder_throttle_delay_ms", default)]
    throttle_delay_ms: u64,

    /// Maximum total size of queued payloads, in bytes.
    ///
    /// When exceeded, the oldest transactions are evicted.
    ///
    /// Defaults to 15 MiB.
    #[serde(rename = "forwarder_max_queue_size_bytes", default = "default_max_queue_size_bytes")]
    max_queue_size_bytes: u64,

    /// Number of failed attempts after which a transaction is dropped.
    ///
    /// Defaults to 20.
    #[serde(rename = "forwarder_max_retries", default = "default_max_retries")]
    max_retries: u32,

    /// Age after which a transaction that still has not been delivered is dropped, in seconds.
    ///
    /// Defaults to 3600 seconds.
    #[serde(
        rename = "forwarder_max_transaction_age",
        default = "default_max_transaction_age_secs"
    )]
    max_transaction_age_secs: u64,

    /// Maximum number of delivery attempts per flush cycle.
    ///
    /// Defaults to 1000.
    #[serde(rename = "forwarder_backlog_send_rate", default = "default_backlog_send_rate")]
    backlog_send_rate: usize,

    /// Delay before the first retry, in seconds.
    ///
    /// Defaults to 2 seconds.
    #[serde(rename = "forwarder_backoff_base", default = "default_backoff_base_secs")]
    backoff_base_secs: f64,

    /// Upper bound on the retry delay, in seconds.
    ///
    /// Defaults to 64 seconds.
    #[serde(rename = "forwarder_backoff_max", default = "default_backoff_max_secs")]
    backoff_max_secs: f64,

    /// Jitter factor. Retry delays are drawn from `[d / factor, d]`, where `d` is the un-jittered delay.
    ///
    /// Defaults to 2.0.
    #[serde(rename = "forwarder_backoff_factor", default = "default_backoff_factor")]
    backoff_factor: f64,
}

impl ForwarderConfiguration {
    /// Reads the forwarder configuration from `config`.
    ///
    /// # Errors
    ///
    /// If any forwarder key is present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Creates a configuration with every value at its default.
    pub fn with_defaults() -> Self {
        Self {
            url: None,
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            throttle_delay_ms: 0,
            max_queue_size_bytes: default_max_queue_size_bytes(),
            max_retries: default_max_retries(),
            max_transaction_age_secs: default_max_transaction_age_secs(),
            backlog_send_rate: default_backlog_send_rate(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }

    /// Sets the queue size ceiling, in bytes.
    pub fn with_max_queue_size_bytes(mut self, max_queue_size_bytes: u64) -> Self {
        self.max_queue_size_bytes = max_queue_size_bytes;
        self
    }

    /// Sets the throttle delay.
    pub fn with_throttle_delay(mut self, throttle_delay: Duration) -> Self {
        self.throttle_delay_ms = throttle_delay.as_millis() as u64;
        self
    }

    /// Sets the number of failed attempts after which a transaction is dropped.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the maximum transaction age.
    pub fn with_max_transaction_age(mut self, max_age: Duration) -> Self {
        self.max_transaction_age_secs = max_age.as_secs();
        self
    }

    /// Sets the number of delivery attempts allowed per flush cycle.
    pub fn with_backlog_send_rate(mut self, backlog_send_rate: usize) -> Self {
        self.backlog_send_rate = backlog_send_rate;
        self
    }

    /// Sets the timeout for a single delivery attempt.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout_secs = request_timeout.as_secs();
        self
    }

    /// Sets the retry backoff bounds, in seconds, and the jitter factor.
    pub fn with_backoff(mut self, base_secs: f64, max_secs: f64, factor: f64) -> Self {
        self.backoff_base_secs = base_secs;
        self.backoff_max_secs = max_secs;
        self.backoff_factor = factor;
        self
    }

    /// Returns the configured URL, if any.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Returns the configured auth token, if any.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Returns the timeout for a single delivery attempt.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Returns the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub(super) fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub(super) fn max_queue_size_bytes(&self) -> u64 {
        self.max_queue_size_bytes
    }

    pub(super) fn max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub(super) fn max_transaction_age(&self) -> Duration {
        Duration::from_secs(self.max_transaction_age_secs)
    }

    pub(super) fn backlog_send_rate(&self) -> usize {
        self.backlog_send_rate.max(1)
    }

    /// Builds the retry backoff policy.
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        let base = secs_f64_or(self.backoff_base_secs, default_backoff_base_secs());
        let max = secs_f64_or(self.backoff_max_secs, default_backoff_max_secs());
        ExponentialBackoff::with_jitter(base, max, self.backoff_factor)
    }
}

fn secs_f64_or(secs: f64, default_secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(default_secs))
}
