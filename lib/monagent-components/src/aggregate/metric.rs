use std::sync::Arc;

use ahash::AHashSet;
use monagent_core::data_model::{Context, Measurement, MetricType};
use ordered_float::OrderedFloat;
use tracing::{debug, info};

use super::config::HistogramConfiguration;

/// Per-context aggregation state.
///
/// Holds one of a fixed set of metric variants, plus the time the context was last sampled, which drives expiry.
#[derive(Debug)]
pub struct Metric {
    state: MetricState,
    last_sample_time: u64,
}

#[derive(Debug)]
enum MetricState {
    Gauge(Gauge),
    BucketGauge(Gauge),
    Counter(Counter),
    Histogram(Histogram),
    Set(Set),
    Rate(Rate),
}

impl Metric {
    /// Creates empty state for `metric_type`.
    ///
    /// Bucketed aggregation stores gauges as bucket gauges, which always report at the bucket timestamp.
    pub fn new(metric_type: MetricType, bucketed: bool, histogram_config: &Arc<HistogramConfiguration>) -> Self {
        let state = match metric_type {
            MetricType::Gauge if bucketed => MetricState::BucketGauge(Gauge::default()),
            MetricType::Gauge => MetricState::Gauge(Gauge::default()),
            MetricType::Counter => MetricState::Counter(Counter::default()),
            MetricType::Histogram => MetricState::Histogram(Histogram::new(Arc::clone(histogram_config))),
            MetricType::Set => MetricState::Set(Set::default()),
            MetricType::Rate => MetricState::Rate(Rate::default()),
        };

        Self {
            state,
            last_sample_time: 0,
        }
    }

    /// Records a value.
    ///
    /// `weight` is the inverse of the sample rate. `timestamp` is the submitted timestamp, if any, and `now` is the
    /// time of submission.
    pub fn sample(&mut self, value: f64, weight: f64, timestamp: Option<u64>, now: u64) {
        self.last_sample_time = now;

        match &mut self.state {
            MetricState::Gauge(gauge) | MetricState::BucketGauge(gauge) => gauge.sample(value, timestamp),
            MetricState::Counter(counter) => counter.value += value * weight,
            MetricState::Histogram(histogram) => {
                histogram.samples.push(value);
                histogram.count += weight;
            }
            MetricState::Set(set) => {
                set.values.insert(OrderedFloat(value));
            }
            MetricState::Rate(rate) => rate.sample(timestamp.unwrap_or(now), value),
        }
    }

    /// Returns the time this context was last sampled.
    pub fn last_sample_time(&self) -> u64 {
        self.last_sample_time
    }

    /// Returns `true` if this is counter state.
    pub fn is_counter(&self) -> bool {
        matches!(self.state, MetricState::Counter(_))
    }

    /// Returns the newest rate sample as `(timestamp, value)`, if this is rate state holding one.
    pub fn latest_rate_sample(&self) -> Option<(u64, f64)> {
        match &self.state {
            MetricState::Rate(rate) => rate.latest,
            _ => None,
        }
    }

    /// Uses `baseline` as the previous rate sample when this state only saw a single sample.
    ///
    /// Bucketed aggregation keeps rate state per bucket, so the sample carried over from the last flushed bucket has
    /// to be handed back in before the next one is flushed.
    pub fn seed_rate_baseline(&mut self, baseline: (u64, f64)) {
        if let MetricState::Rate(rate) = &mut self.state {
            if rate.previous.is_none() && rate.latest.is_some() {
                rate.previous = Some(baseline);
            }
        }
    }

    /// Emits this interval's measurements into `out` and resets the interval state.
    ///
    /// Returns the number of measurements emitted.
    pub fn flush(&mut self, context: &Context, timestamp: u64, interval_secs: u64, out: &mut Vec<Measurement>) -> usize {
        let before = out.len();
        let interval_secs = interval_secs.max(1) as f64;
        let mut emit = |name: String, ts: u64, value: f64| {
            out.push(
                Measurement::new(name, ts, value)
                    .with_dimensions(context.emitted_dimensions().clone())
                    .with_delegated_tenant(context.delegated_tenant().map(String::from)),
            );
        };

        match &mut self.state {
            MetricState::Gauge(gauge) => {
                if let Some((value, submitted_ts)) = gauge.take() {
                    emit(context.name().to_string(), submitted_ts.unwrap_or(timestamp), value);
                }
            }
            MetricState::BucketGauge(gauge) => {
                if let Some((value, _)) = gauge.take() {
                    emit(context.name().to_string(), timestamp, value);
                }
            }
            MetricState::Counter(counter) => {
                let value = std::mem::take(&mut counter.value);
                emit(context.name().to_string(), timestamp, value / interval_secs);
            }
            MetricState::Histogram(histogram) => {
                if !histogram.samples.is_empty() {
                    histogram.samples.sort_unstable_by(f64::total_cmp);
                    for statistic in histogram.config.statistics() {
                        let value = statistic.compute(&histogram.samples, histogram.count, interval_secs);
                        emit(format!("{}.{}", context.name(), statistic.suffix()), timestamp, value);
                    }
                }
                histogram.samples.clear();
                histogram.count = 0.0;
            }
            MetricState::Set(set) => {
                if !set.values.is_empty() {
                    emit(context.name().to_string(), timestamp, set.values.len() as f64);
                    set.values.clear();
                }
            }
            MetricState::Rate(rate) => {
                if let Some(value) = rate.take(context) {
                    emit(context.name().to_string(), timestamp, value);
                }
            }
        }

        out.len() - before
    }
}

/// Emits a zero-valued counter point for `context`, used to keep idle counters continuous.
pub fn zero_value_counter(context: &Context, timestamp: u64) -> Measurement {
    Measurement::new(context.name(), timestamp, 0.0)
        .with_dimensions(context.emitted_dimensions().clone())
        .with_delegated_tenant(context.delegated_tenant().map(String::from))
}

#[derive(Debug, Default)]
struct Gauge {
    value: Option<(f64, Option<u64>)>,
}

impl Gauge {
    fn sample(&mut self, value: f64, timestamp: Option<u64>) {
        self.value = Some((value, timestamp));
    }

    fn take(&mut self) -> Option<(f64, Option<u64>)> {
        self.value.take()
    }
}

#[derive(Debug, Default)]
struct Counter {
    value: f64,
}

#[derive(Debug)]
struct Histogram {
    samples: Vec<f64>,
    count: f64,
    config: Arc<HistogramConfiguration>,
}

impl Histogram {
    fn new(config: Arc<HistogramConfiguration>) -> Self {
        Self {
            samples: Vec::new(),
            count: 0.0,
            config,
        }
    }
}

#[derive(Debug, Default)]
struct Set {
    values: AHashSet<OrderedFloat<f64>>,
}

#[derive(Debug, Default)]
struct Rate {
    previous: Option<(u64, f64)>,
    latest: Option<(u64, f64)>,
}

impl Rate {
    fn sample(&mut self, timestamp: u64, value: f64) {
        if let Some(latest) = self.latest.replace((timestamp, value)) {
            self.previous = Some(latest);
        }
    }

    /// Computes the rate between the two most recent samples, keeping only the newest one afterwards.
    fn take(&mut self, context: &Context) -> Option<f64> {
        let (t1, v1) = self.previous.take()?;
        let (t2, v2) = self.latest?;

        if t2 == t1 {
            debug!(%context, t1, t2, "Rate samples have no elapsed time between them. Skipping flush.");
            return None;
        }

        if t2 < t1 {
            debug!(%context, t1, t2, "Newest rate sample is older than the previous one. Skipping flush.");
            return None;
        }

        let delta = v2 - v1;
        if delta < 0.0 {
            info!(%context, previous = v1, current = v2, "Rate went negative. Counter may have been reset.");
            return None;
        }

        Some(delta / (t2 - t1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use monagent_core::data_model::Dimensions;

    use super::*;

    const INTERVAL: u64 = 10;
    const NOW: u64 = 1_000;

    fn context(name: &str) -> Context {
        Context::new(name.into(), Dimensions::new(), None, None, None)
    }

    fn metric(metric_type: MetricType) -> Metric {
        Metric::new(metric_type, false, &Arc::new(HistogramConfiguration::default()))
    }

    fn flush(metric: &mut Metric, context: &Context, timestamp: u64) -> Vec<Measurement> {
        let mut out = Vec::new();
        metric.flush(context, timestamp, INTERVAL, &mut out);
        out
    }

    fn values(measurements: &[Measurement]) -> Vec<(&str, f64)> {
        measurements.iter().map(|m| (m.name.as_str(), m.value)).collect()
    }

    #[test]
    fn gauge_last_value_wins() {
        let ctx = context("cpu.pct");
        let mut gauge = metric(MetricType::Gauge);
        for value in [10.0, 30.0, 20.0] {
            gauge.sample(value, 1.0, None, NOW);
        }

        let flushed = flush(&mut gauge, &ctx, NOW + 5);
        assert_eq!(values(&flushed), vec![("cpu.pct", 20.0)]);
        assert_eq!(flushed[0].timestamp, NOW + 5);

        // Cleared after flushing.
        assert!(flush(&mut gauge, &ctx, NOW + 15).is_empty());
    }

    #[test]
    fn gauge_keeps_submitted_timestamp_but_bucket_gauge_does_not() {
        let ctx = context("cpu.pct");
        let mut gauge = metric(MetricType::Gauge);
        gauge.sample(1.0, 1.0, Some(NOW - 3), NOW);
        assert_eq!(flush(&mut gauge, &ctx, NOW)[0].timestamp, NOW - 3);

        let mut bucket_gauge = Metric::new(MetricType::Gauge, true, &Arc::new(HistogramConfiguration::default()));
        bucket_gauge.sample(1.0, 1.0, Some(NOW - 3), NOW);
        assert_eq!(flush(&mut bucket_gauge, &ctx, NOW - 10)[0].timestamp, NOW - 10);
    }

    #[test]
    fn counter_emits_per_second_rate_and_resets() {
        let ctx = context("req.count");
        let mut counter = metric(MetricType::Counter);
        counter.sample(5.0, 1.0, None, NOW);
        counter.sample(3.0, 1.0, None, NOW);

        assert_eq!(values(&flush(&mut counter, &ctx, NOW)), vec![("req.count", 0.8)]);
        assert_eq!(values(&flush(&mut counter, &ctx, NOW + 10)), vec![("req.count", 0.0)]);
    }

    #[test]
    fn counter_scales_by_sample_rate() {
        let ctx = context("req.count");
        let mut counter = metric(MetricType::Counter);
        counter.sample(1.0, 4.0, None, NOW);
        assert_eq!(values(&flush(&mut counter, &ctx, NOW)), vec![("req.count", 0.4)]);
    }

    #[test]
    fn histogram_default_statistics() {
        let ctx = context("latency");
        let mut histogram = metric(MetricType::Histogram);
        for value in [5.0, 1.0, 4.0, 2.0, 3.0] {
            histogram.sample(value, 1.0, None, NOW);
        }

        let flushed = flush(&mut histogram, &ctx, NOW);
        assert_eq!(
            values(&flushed),
            vec![
                ("latency.max", 5.0),
                ("latency.median", 3.0),
                ("latency.avg", 3.0),
                ("latency.count", 0.5),
                ("latency.95percentile", 5.0),
            ]
        );
        assert!(flush(&mut histogram, &ctx, NOW + 10).is_empty());
    }

    #[test]
    fn set_counts_unique_values() {
        let ctx = context("users.unique");
        let mut set = metric(MetricType::Set);
        for value in [1.0, 2.0, 2.0, 3.0, 1.0] {
            set.sample(value, 1.0, None, NOW);
        }

        assert_eq!(values(&flush(&mut set, &ctx, NOW)), vec![("users.unique", 3.0)]);
        assert!(flush(&mut set, &ctx, NOW + 10).is_empty());
    }

    #[test]
    fn rate_needs_two_samples() {
        let ctx = context("net.bytes");
        let mut rate = metric(MetricType::Rate);
        rate.sample(100.0, 1.0, Some(NOW), NOW);
        assert!(flush(&mut rate, &ctx, NOW).is_empty());

        rate.sample(150.0, 1.0, Some(NOW + 10), NOW + 10);
        assert_eq!(values(&flush(&mut rate, &ctx, NOW + 10)), vec![("net.bytes", 5.0)]);

        // Only the newest sample is kept, so the next rate is computed from it.
        rate.sample(170.0, 1.0, Some(NOW + 20), NOW + 20);
        assert_eq!(values(&flush(&mut rate, &ctx, NOW + 20)), vec![("net.bytes", 2.0)]);
    }

    #[test]
    fn rate_regression_is_skipped() {
        let ctx = context("net.bytes");
        let mut rate = metric(MetricType::Rate);
        rate.sample(100.0, 1.0, Some(NOW), NOW);
        rate.sample(80.0, 1.0, Some(NOW + 10), NOW + 10);
        assert!(flush(&mut rate, &ctx, NOW + 10).is_empty());

        // The regressed value becomes the new baseline.
        rate.sample(90.0, 1.0, Some(NOW + 20), NOW + 20);
        assert_eq!(values(&flush(&mut rate, &ctx, NOW + 20)), vec![("net.bytes", 1.0)]);
    }

    #[test]
    fn rate_without_elapsed_time_is_skipped() {
        let ctx = context("net.bytes");
        let mut rate = metric(MetricType::Rate);
        rate.sample(100.0, 1.0, Some(NOW), NOW);
        rate.sample(120.0, 1.0, Some(NOW), NOW);
        assert!(flush(&mut rate, &ctx, NOW).is_empty());
    }

    #[test]
    fn rate_with_out_of_order_timestamps_is_skipped() {
        let ctx = context("net.bytes");
        let mut rate = metric(MetricType::Rate);
        rate.sample(100.0, 1.0, Some(NOW + 10), NOW);
        rate.sample(120.0, 1.0, Some(NOW), NOW);
        assert!(flush(&mut rate, &ctx, NOW + 10).is_empty());
    }

    #[test]
    fn seeded_rate_baseline_completes_a_single_sample() {
        let ctx = context("net.bytes");
        let mut rate = metric(MetricType::Rate);
        rate.sample(150.0, 1.0, None, NOW + 10);
        assert_eq!(rate.latest_rate_sample(), Some((NOW + 10, 150.0)));

        rate.seed_rate_baseline((NOW, 100.0));
        assert_eq!(values(&flush(&mut rate, &ctx, NOW + 10)), vec![("net.bytes", 5.0)]);

        // Two samples of its own: the baseline is ignored.
        rate.sample(170.0, 1.0, None, NOW + 20);
        rate.seed_rate_baseline((NOW, 0.0));
        assert_eq!(values(&flush(&mut rate, &ctx, NOW + 20)), vec![("net.bytes", 2.0)]);
    }

    #[test]
    fn seeding_other_metric_types_is_a_no_op() {
        let ctx = context("temp");
        let mut gauge = metric(MetricType::Gauge);
        gauge.sample(1.0, 1.0, None, NOW);
        gauge.seed_rate_baseline((NOW - 10, 0.0));
        assert!(gauge.latest_rate_sample().is_none());
        assert_eq!(values(&flush(&mut gauge, &ctx, NOW)), vec![("temp", 1.0)]);
    }

    #[test]
    fn host_device_and_tenant_are_emitted() {
        let ctx = Context::new(
            "io.read".into(),
            Dimensions::new(),
            Some("tenant-a".into()),
            Some("web-1".into()),
            Some("sda".into()),
        );
        let mut gauge = metric(MetricType::Gauge);
        gauge.sample(1.0, 1.0, None, NOW);

        let flushed = flush(&mut gauge, &ctx, NOW);
        assert_eq!(flushed[0].dimensions["hostname"], "web-1");
        assert_eq!(flushed[0].dimensions["device"], "sda");
        assert_eq!(flushed[0].delegated_tenant.as_deref(), Some("tenant-a"));
    }
}
