use std::{path::PathBuf, time::Duration};

use monagent_config::GenericConfiguration;
use monagent_core::data_model::Dimensions;
use monagent_error::GenericError;
use serde::Deserialize;

const fn default_interval_secs() -> u64 {
    15
}

const fn default_check_timeout_secs() -> u64 {
    30
}

const fn default_max_batch_size() -> usize {
    500
}

/// Collector configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct CollectorConfiguration {
    /// How often checks are run, in seconds.
    ///
    /// Defaults to 15 seconds.
    #[serde(rename = "collector_interval", default = "default_interval_secs")]
    interval_secs: u64,

    /// Maximum time a single check may run for, in seconds.
    ///
    /// Defaults to 30 seconds.
    #[serde(rename = "collector_check_timeout", default = "default_check_timeout_secs")]
    check_timeout_secs: u64,

    /// Host name added as the `hostname` dimension of every measurement that does not already have one.
    #[serde(default)]
    hostname: Option<String>,

    /// Dimensions added to every measurement that does not already define them.
    #[serde(default)]
    dimensions: Dimensions,

    /// Maximum number of measurements per transaction.
    ///
    /// Defaults to 500.
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,

    /// File the status snapshot is written to after every run, as JSON.
    #[serde(default)]
    status_path: Option<PathBuf>,
}

impl CollectorConfiguration {
    /// Reads the collector configuration from `config`.
    ///
    /// # Errors
    ///
    /// If any collector key is present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Creates a configuration with every value at its default.
    pub fn with_defaults() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            hostname: None,
            dimensions: Dimensions::new(),
            max_batch_size: default_max_batch_size(),
            status_path: None,
        }
    }

    /// Sets the check timeout.
    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout_secs = check_timeout.as_secs();
        self
    }

    /// Sets the host name.
    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Adds a default dimension.
    pub fn with_dimension<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Sets the maximum number of measurements per transaction.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Sets the status file path.
    pub fn with_status_path<P: Into<PathBuf>>(mut self, status_path: P) -> Self {
        self.status_path = Some(status_path.into());
        self
    }

    /// Returns the run interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Returns the check timeout.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs.max(1))
    }

    /// Returns the maximum number of measurements per transaction.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    /// Returns the status file path, if any.
    pub fn status_path(&self) -> Option<&PathBuf> {
        self.status_path.as_ref()
    }

    /// Returns the dimensions merged into every measurement, including `hostname` if configured.
    pub fn default_dimensions(&self) -> Dimensions {
        let mut dimensions = self.dimensions.clone();
        if let Some(hostname) = &self.hostname {
            dimensions
                .entry("hostname".to_string())
                .or_insert_with(|| hostname.clone());
        }
        dimensions
    }
}
