use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Measurement dimensions.
///
/// Kept sorted by key, which makes context derivation and serialized output deterministic.
pub type Dimensions = BTreeMap<String, String>;

/// A single timestamped, dimensioned data point, ready to be sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Metric name.
    pub name: String,

    /// Unix timestamp, in seconds.
    pub timestamp: u64,

    /// Value.
    pub value: f64,

    /// Dimensions.
    #[serde(default)]
    pub dimensions: Dimensions,

    /// Tenant the measurement is submitted on behalf of, if not the agent's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_tenant: Option<String>,
}

impl Measurement {
    /// Creates a measurement without dimensions.
    pub fn new<N: Into<String>>(name: N, timestamp: u64, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
            dimensions: Dimensions::new(),
            delegated_tenant: None,
        }
    }

    /// Sets the dimensions.
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Adds a single dimension, replacing any existing value for `key`.
    pub fn with_dimension<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Sets the delegated tenant.
    pub fn with_delegated_tenant(mut self, tenant: Option<String>) -> Self {
        self.delegated_tenant = tenant;
        self
    }

    /// Fills in any of `defaults` that this measurement does not already define.
    pub fn merge_default_dimensions(&mut self, defaults: &Dimensions) {
        for (key, value) in defaults {
            if !self.dimensions.contains_key(key) {
                self.dimensions.insert(key.clone(), value.clone());
            }
        }
    }
}
