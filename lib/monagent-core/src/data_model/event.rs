use serde::{Deserialize, Serialize};

use super::Dimensions;

/// A free-form occurrence reported by a check, such as a service restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Short summary.
    pub title: String,

    /// Longer description.
    #[serde(default)]
    pub text: String,

    /// Unix timestamp, in seconds.
    pub timestamp: u64,

    /// Dimensions.
    #[serde(default)]
    pub dimensions: Dimensions,
}

impl Event {
    /// Creates an event.
    pub fn new<T: Into<String>, X: Into<String>>(title: T, text: X, timestamp: u64) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            timestamp,
            dimensions: Dimensions::new(),
        }
    }
}
