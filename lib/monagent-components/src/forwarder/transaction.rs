use std::time::Duration;

use bytes::Bytes;
use monagent_core::data_model::{
    payload::{encode_batch, PayloadError},
    Measurement,
};
use tokio::time::Instant;

/// A serialized batch of measurements awaiting delivery.
///
/// Transactions are created by producers and handed to the `TransactionManager`, which assigns the identifier on
/// append and owns all retry bookkeeping from then on.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: u64,
    payload: Bytes,
    measurement_count: usize,
    created_at: Instant,
    error_count: u32,
    next_attempt: Instant,
}

impl Transaction {
    /// Creates a transaction around an already encoded payload.
    pub fn new(payload: Bytes, measurement_count: usize) -> Self {
        let created_at = Instant::now();
        Self {
            id: 0,
            payload,
            measurement_count,
            created_at,
            error_count: 0,
            next_attempt: created_at,
        }
    }

    /// Encodes `measurements` and wraps the result in a transaction.
    ///
    /// # Errors
    ///
    /// If the batch cannot be encoded, an error is returned.
    pub fn from_measurements(measurements: &[Measurement]) -> Result<Self, PayloadError> {
        let payload = encode_batch(measurements)?;
        Ok(Self::new(payload, measurements.len()))
    }

    /// Returns the identifier assigned on append, or zero if the transaction was never queued.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Returns the encoded payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the number of measurements in the payload.
    pub fn measurement_count(&self) -> usize {
        self.measurement_count
    }

    /// Returns the size of the payload, in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Returns how many delivery attempts have failed so far.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Returns how long ago the transaction was created.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Returns `true` if the transaction may be attempted at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt <= now
    }

    /// Records a failed attempt and schedules the next one `delay` after `now`.
    pub(super) fn record_failure(&mut self, now: Instant, delay: Duration) {
        self.error_count = self.error_count.saturating_add(1);
        self.next_attempt = now + delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failure_defers_next_attempt() {
        let mut tx = Transaction::new(Bytes::from_static(b"[]"), 0);
        let now = Instant::now();
        assert!(tx.is_due(now));

        tx.record_failure(now, Duration::from_secs(4));
        assert_eq!(tx.error_count(), 1);
        assert!(!tx.is_due(now + Duration::from_secs(3)));
        assert!(tx.is_due(now + Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn age_tracks_creation_time() {
        let tx = Transaction::from_measurements(&[Measurement::new("cpu.pct", 1, 42.0)]).unwrap();
        assert_eq!(tx.measurement_count(), 1);
        assert_eq!(tx.size_bytes(), tx.payload().len() as u64);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(tx.age(Instant::now()), Duration::from_secs(90));
    }
}
