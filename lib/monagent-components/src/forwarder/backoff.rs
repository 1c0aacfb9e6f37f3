use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{rngs::StdRng, Rng as _, SeedableRng as _};

/// Where jitter comes from.
#[derive(Clone)]
enum JitterSource {
    /// The thread-local, OS-seeded generator.
    Thread,

    /// A seeded generator, shared between clones, for reproducible tests.
    Seeded(Arc<Mutex<StdRng>>),
}

impl JitterSource {
    fn between(&self, lower: Duration, upper: Duration) -> Duration {
        match self {
            Self::Thread => rand::rng().random_range(lower..=upper),
            Self::Seeded(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random_range(lower..=upper),
        }
    }
}

impl fmt::Debug for JitterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => f.write_str("Thread"),
            Self::Seeded(_) => f.write_str("Seeded"),
        }
    }
}

/// Exponential backoff between delivery attempts.
///
/// The delay for a transaction that has failed `n` times is `min * 2^n`, bounded to `[min, max]`. With a jitter factor
/// `f` above 1.0, the delay is instead drawn uniformly from `[d/f, d]` before bounding, which spreads out retries of
/// transactions that failed together.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    jitter_factor: f64,
    jitter: JitterSource,
}

impl ExponentialBackoff {
    /// Creates a backoff without jitter.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self::with_jitter(min_backoff, max_backoff, 1.0)
    }

    /// Creates a backoff with the given jitter factor. Factors of 1.0 or less disable jitter.
    pub fn with_jitter(min_backoff: Duration, max_backoff: Duration, jitter_factor: f64) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            jitter_factor: if jitter_factor.is_finite() { jitter_factor.max(1.0) } else { 1.0 },
            jitter: JitterSource::Thread,
        }
    }

    /// Draws jitter from a generator seeded with `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.jitter = JitterSource::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }

    /// Returns the lower bound.
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Returns the upper bound.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the delay to wait after the `error_count`-th consecutive failure.
    pub fn get_backoff_duration(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.min_backoff;
        }

        let mut backoff = self.min_backoff.saturating_mul(2u32.saturating_pow(error_count));
        if self.jitter_factor > 1.0 {
            backoff = self.jitter.between(backoff.div_f64(self.jitter_factor), backoff);
        }

        backoff.clamp(self.min_backoff, self.max_backoff)
    }
}
