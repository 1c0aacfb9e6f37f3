//! Metric aggregation.
//!
//! Samples submitted by checks are accumulated per [`Context`][monagent_core::data_model::Context] and turned into
//! measurements when the aggregator is flushed. Two aggregators are provided:
//!
//! - [`Aggregator`] keeps a single value per context and flushes everything it holds, at the flush time.
//! - [`BucketedAggregator`] aligns samples to fixed-width time buckets by their timestamp, and flushes each bucket once
//!   it has closed, at the bucket's start time. Late samples still land in their own bucket, as long as that bucket has
//!   not been flushed yet.
//!
//! ## Expiry and zero-value counters
//!
//! A context that has not been sampled for the expiry period is forgotten. Until then, gauges, histograms, sets, and
//! rates simply stop reporting when they receive no new samples, while counters keep reporting a value of zero for
//! every interval they were idle in. This keeps rate series derived from sparse counters free of gaps.
use std::sync::{Arc, Mutex, PoisonError};

use monagent_config::GenericConfiguration;
use monagent_core::{
    data_model::{Dimensions, Measurement, MetricSample},
    time::Clock,
};
use monagent_error::GenericError;
use serde::Deserialize;

mod bucketed;
pub use self::bucketed::BucketedAggregator;

mod config;
pub use self::config::{HistogramConfiguration, HistogramStatistic};

mod flat;
pub use self::flat::Aggregator;

mod metric;

mod telemetry;

const fn default_interval_secs() -> u64 {
    15
}

const fn default_expiry_secs() -> u64 {
    300
}

const fn default_recent_point_threshold_secs() -> u64 {
    3600
}

/// Aggregator configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AggregateConfiguration {
    /// Aggregation interval, in seconds.
    ///
    /// For bucketed aggregation, this is the bucket width. Counters and histogram counts are divided by it to produce
    /// per-second rates.
    ///
    /// Defaults to 15 seconds.
    #[serde(rename = "aggregate_interval", default = "default_interval_secs")]
    interval_secs: u64,

    /// How long a context may go without samples before it is forgotten, in seconds.
    ///
    /// Defaults to 300 seconds.
    #[serde(rename = "aggregate_expiry_seconds", default = "default_expiry_secs")]
    expiry_secs: u64,

    /// Maximum age of a sample's timestamp, in seconds.
    ///
    /// Samples timestamped further in the past than this are dropped rather than backdating aggregates.
    ///
    /// Defaults to 3600 seconds.
    #[serde(
        rename = "aggregate_recent_point_threshold",
        default = "default_recent_point_threshold_secs"
    )]
    recent_point_threshold_secs: u64,

    /// Maximum number of contexts held at once, per bucket when bucketed.
    ///
    /// Samples for new contexts beyond the limit are dropped. Zero means unlimited.
    ///
    /// Defaults to 0.
    #[serde(rename = "aggregate_context_limit", default)]
    context_limit: usize,

    /// Histogram statistics.
    #[serde(flatten)]
    histogram_config: HistogramConfiguration,
}

impl AggregateConfiguration {
    /// Reads the aggregator configuration from `config`.
    ///
    /// # Errors
    ///
    /// If any aggregator key is present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Creates a configuration with every value at its default.
    pub fn with_defaults() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            expiry_secs: default_expiry_secs(),
            recent_point_threshold_secs: default_recent_point_threshold_secs(),
            context_limit: 0,
            histogram_config: HistogramConfiguration::default(),
        }
    }

    /// Sets the aggregation interval, in seconds.
    pub fn with_interval_secs(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs.max(1);
        self
    }

    /// Sets the expiry period, in seconds.
    pub fn with_expiry_secs(mut self, expiry_secs: u64) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    /// Sets the recent-point threshold, in seconds.
    pub fn with_recent_point_threshold_secs(mut self, threshold_secs: u64) -> Self {
        self.recent_point_threshold_secs = threshold_secs;
        self
    }

    /// Sets the context limit.
    pub fn with_context_limit(mut self, context_limit: usize) -> Self {
        self.context_limit = context_limit;
        self
    }

    /// Sets the histogram statistics.
    pub fn with_histogram_config(mut self, histogram_config: HistogramConfiguration) -> Self {
        self.histogram_config = histogram_config;
        self
    }

    /// Returns the aggregation interval, in seconds.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.max(1)
    }

    fn admission(&self) -> Admission {
        Admission {
            recent_point_threshold_secs: self.recent_point_threshold_secs,
            context_limit: self.context_limit,
        }
    }
}

/// What happened to a submitted sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// The sample was aggregated.
    Accepted,

    /// The sample's timestamp was older than the recent-point threshold.
    Stale,

    /// The sample's bucket had already been flushed.
    Late,

    /// The sample belonged to a new context, and the context limit was reached.
    ContextLimitReached,
}

/// Sample admission rules shared by both aggregators.
#[derive(Clone, Copy, Debug)]
struct Admission {
    recent_point_threshold_secs: u64,
    context_limit: usize,
}

impl Admission {
    fn is_stale(&self, timestamp: Option<u64>, now: u64) -> bool {
        timestamp.is_some_and(|ts| ts < now.saturating_sub(self.recent_point_threshold_secs))
    }

    fn has_room(&self, current_contexts: usize) -> bool {
        self.context_limit == 0 || current_contexts < self.context_limit
    }
}

/// The submission and flush interface shared by both aggregators.
pub trait MetricAggregator: Send {
    /// Submits a sample, using the aggregator's clock for the submission time.
    fn submit_metric(&mut self, sample: MetricSample) -> SubmitOutcome;

    /// Flushes every eligible context as of `now`.
    fn flush_at(&mut self, now: u64) -> Vec<Measurement>;

    /// Flushes every eligible context as of the aggregator's clock.
    fn flush(&mut self) -> Vec<Measurement>;

    /// Returns the number of contexts currently held.
    fn context_count(&self) -> usize;

    /// Submits a gauge value.
    fn gauge(&mut self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.submit_metric(MetricSample::gauge(name, value).with_dimensions(dimensions))
    }

    /// Submits a counter increment.
    fn increment(&mut self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.submit_metric(MetricSample::counter(name, value).with_dimensions(dimensions))
    }

    /// Submits a histogram value.
    fn histogram(&mut self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.submit_metric(MetricSample::histogram(name, value).with_dimensions(dimensions))
    }

    /// Submits a set member.
    fn set(&mut self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.submit_metric(MetricSample::set(name, value).with_dimensions(dimensions))
    }

    /// Submits the current value of a monotonic counter, to be reported as a per-second rate.
    fn rate(&mut self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.submit_metric(MetricSample::rate(name, value).with_dimensions(dimensions))
    }
}

/// A cloneable, thread-safe handle to an aggregator.
///
/// Checks that submit samples instead of returning finished measurements hold a clone of the handle, and the collector
/// flushes it once per run.
#[derive(Clone)]
pub struct AggregatorHandle {
    inner: Arc<Mutex<Box<dyn MetricAggregator>>>,
}

impl AggregatorHandle {
    /// Wraps `aggregator` in a handle.
    pub fn new<A: MetricAggregator + 'static>(aggregator: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(aggregator))),
        }
    }

    /// Runs `f` with exclusive access to the aggregator.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut dyn MetricAggregator) -> R,
    {
        let mut aggregator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(aggregator.as_mut())
    }

    /// Submits a sample.
    pub fn submit_metric(&self, sample: MetricSample) -> SubmitOutcome {
        self.with(|aggregator| aggregator.submit_metric(sample))
    }

    /// Submits a gauge value.
    pub fn gauge(&self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.with(|aggregator| aggregator.gauge(name, value, dimensions))
    }

    /// Submits a counter increment.
    pub fn increment(&self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.with(|aggregator| aggregator.increment(name, value, dimensions))
    }

    /// Submits a histogram value.
    pub fn histogram(&self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.with(|aggregator| aggregator.histogram(name, value, dimensions))
    }

    /// Submits a set member.
    pub fn set(&self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.with(|aggregator| aggregator.set(name, value, dimensions))
    }

    /// Submits the current value of a monotonic counter.
    pub fn rate(&self, name: &str, value: f64, dimensions: Dimensions) -> SubmitOutcome {
        self.with(|aggregator| aggregator.rate(name, value, dimensions))
    }

    /// Flushes the aggregator as of its own clock.
    pub fn flush(&self) -> Vec<Measurement> {
        self.with(|aggregator| aggregator.flush())
    }
}

/// Builds the aggregator selected by `bucketed`.
pub fn build_aggregator(config: &AggregateConfiguration, bucketed: bool, clock: Arc<dyn Clock>) -> AggregatorHandle {
    if bucketed {
        AggregatorHandle::new(BucketedAggregator::new(config, clock))
    } else {
        AggregatorHandle::new(Aggregator::new(config, clock))
    }
}

#[cfg(test)]
mod tests {
    use monagent_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    #[test]
    fn configuration_defaults() {
        let config = AggregateConfiguration::from_configuration(&ConfigurationLoader::for_tests(None)).unwrap();
        assert_eq!(config.interval_secs(), 15);
        assert_eq!(config.expiry_secs, 300);
        assert_eq!(config.recent_point_threshold_secs, 3600);
        assert_eq!(config.context_limit, 0);
        assert_eq!(config.histogram_config, HistogramConfiguration::default());
    }

    #[test]
    fn configuration_overrides() {
        let config = AggregateConfiguration::from_configuration(&ConfigurationLoader::for_tests(Some(json!({
            "aggregate_interval": 20,
            "aggregate_expiry_seconds": 60,
            "histogram_aggregates": ["min", "sum"],
            "histogram_percentiles": [0.5, 0.99],
        }))))
        .unwrap();

        assert_eq!(config.interval_secs(), 20);
        assert_eq!(config.expiry_secs, 60);
        let suffixes = config
            .histogram_config
            .statistics()
            .iter()
            .map(|s| s.suffix())
            .collect::<Vec<_>>();
        assert_eq!(suffixes, vec!["min", "sum", "50percentile", "99percentile"]);
    }

    #[test]
    fn invalid_histogram_aggregate_rejected() {
        let config = ConfigurationLoader::for_tests(Some(json!({ "histogram_aggregates": ["p42"] })));
        assert!(AggregateConfiguration::from_configuration(&config).is_err());
    }

    #[test]
    fn stale_admission() {
        let admission = AggregateConfiguration::with_defaults()
            .with_recent_point_threshold_secs(100)
            .admission();

        assert!(!admission.is_stale(None, 1_000));
        assert!(!admission.is_stale(Some(900), 1_000));
        assert!(admission.is_stale(Some(899), 1_000));
        // Early in the epoch nothing can be stale.
        assert!(!admission.is_stale(Some(0), 50));
    }
}
