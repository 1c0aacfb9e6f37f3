//! Wire encoding for measurement batches.
//!
//! A batch is a JSON array of measurement objects:
//!
//! ```json
//! [{"name": "cpu.idle_perc", "timestamp": 1700000000, "value": 97.5, "dimensions": {"hostname": "web-1"}}]
//! ```
//!
//! `delegated_tenant` is only present when set.
use bytes::Bytes;
use snafu::{ResultExt as _, Snafu};

use super::Measurement;

/// A batch encoding or decoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PayloadError {
    /// A measurement could not be serialized.
    #[snafu(display("Failed to encode measurement batch."))]
    Encode {
        /// Error source.
        source: serde_json::Error,
    },

    /// The payload was not a valid batch.
    #[snafu(display("Failed to decode measurement batch."))]
    Decode {
        /// Error source.
        source: serde_json::Error,
    },
}

/// Encodes a batch of measurements.
///
/// # Errors
///
/// If any measurement holds a non-finite value, which JSON cannot represent, an error is returned.
pub fn encode_batch(measurements: &[Measurement]) -> Result<Bytes, PayloadError> {
    if let Some(bad) = measurements.iter().find(|m| !m.value.is_finite()) {
        let source = <serde_json::Error as serde::ser::Error>::custom(format!(
            "measurement '{}' has non-finite value {}",
            bad.name, bad.value
        ));
        return Err(PayloadError::Encode { source });
    }

    serde_json::to_vec(measurements).map(Bytes::from).context(Encode)
}

/// Decodes a batch of measurements.
///
/// # Errors
///
/// If the payload is not a JSON array of measurements, an error is returned.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Measurement>, PayloadError> {
    serde_json::from_slice(payload).context(Decode)
}
