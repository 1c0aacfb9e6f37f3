//! Wall-clock access.
//!
//! Aggregation works on whole Unix seconds. Components take a [`Clock`] rather than reading the system time directly so
//! that a whole flush pass can be computed against one timestamp, and so tests can drive time by hand.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

/// Returns the current Unix timestamp, in seconds.
pub fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A source of Unix timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current Unix timestamp, in seconds.
    fn unix_timestamp(&self) -> u64;
}

/// A [`Clock`] backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_timestamp(&self) -> u64 {
        get_unix_timestamp()
    }
}

/// A [`Clock`] that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `now`.
    pub fn new(now: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn unix_timestamp(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
