use std::{
    collections::{hash_map::Entry, BTreeMap},
    sync::Arc,
};

use ahash::AHashMap;
use monagent_core::{
    data_model::{Context, Measurement, MetricSample},
    observability::MetricsBuilder,
    time::Clock,
};
use tracing::{debug, trace, warn};

use super::{
    metric::{zero_value_counter, Metric},
    telemetry::Telemetry,
    Admission, AggregateConfiguration, HistogramConfiguration, MetricAggregator, SubmitOutcome,
};

type Bucket = AHashMap<Context, Metric>;

/// Newest rate sample seen for a context in an already flushed bucket.
#[derive(Clone, Copy, Debug)]
struct RateBaseline {
    timestamp: u64,
    value: f64,
    last_seen: u64,
}

/// Aggregates samples into fixed-width time buckets.
///
/// Each sample lands in the bucket containing its timestamp, or the submission time when it has none. A bucket is
/// flushed once the bucket it belongs to is in the past, which means every context reports exactly once per interval
/// no matter the order samples arrived in.
///
/// Counters that were flushed in an earlier bucket, but received no samples in a later one, report a zero value for
/// that later bucket until they expire. When a flush finds no closed buckets at all but at least one interval has
/// passed, the zero values are emitted for the interval that just ended.
///
/// Rates need two samples, which usually come from different buckets. The newest sample of each flushed rate is
/// carried over as the baseline for the next bucket, until the context expires.
pub struct BucketedAggregator {
    interval_secs: u64,
    expiry_secs: u64,
    admission: Admission,
    histogram_config: Arc<HistogramConfiguration>,
    clock: Arc<dyn Clock>,
    buckets: BTreeMap<u64, Bucket>,
    counter_last_seen: AHashMap<Context, u64>,
    rate_baselines: AHashMap<Context, RateBaseline>,
    last_flush_cutoff: u64,
    stale_since_flush: u64,
    stale_total: u64,
    telemetry: Telemetry,
}

impl BucketedAggregator {
    /// Creates a bucketed aggregator.
    pub fn new(config: &AggregateConfiguration, clock: Arc<dyn Clock>) -> Self {
        let telemetry =
            Telemetry::new(&MetricsBuilder::for_component("aggregator").add_default_tag(("mode", "bucketed")));
        Self::from_parts(config, clock, telemetry)
    }

    fn from_parts(config: &AggregateConfiguration, clock: Arc<dyn Clock>, telemetry: Telemetry) -> Self {
        Self {
            interval_secs: config.interval_secs(),
            expiry_secs: config.expiry_secs,
            admission: config.admission(),
            histogram_config: Arc::new(config.histogram_config.clone()),
            clock,
            buckets: BTreeMap::new(),
            counter_last_seen: AHashMap::default(),
            rate_baselines: AHashMap::default(),
            last_flush_cutoff: 0,
            stale_since_flush: 0,
            stale_total: 0,
            telemetry,
        }
    }

    /// Returns the number of samples dropped for being too old, or for arriving after their bucket was flushed.
    pub fn discarded_stale_samples(&self) -> u64 {
        self.stale_total
    }

    fn bucket_start(&self, timestamp: u64) -> u64 {
        align_to_bucket_start(timestamp, self.interval_secs)
    }

    fn record_discard(&mut self) {
        self.stale_since_flush += 1;
        self.stale_total += 1;
        self.telemetry.stale_sample_dropped();
    }

    fn submit_at(&mut self, sample: MetricSample, now: u64) -> SubmitOutcome {
        if self.admission.is_stale(sample.timestamp, now) {
            self.record_discard();
            return SubmitOutcome::Stale;
        }

        let bucket_start = self.bucket_start(sample.timestamp.unwrap_or(now));
        if bucket_start < self.last_flush_cutoff {
            trace!(
                name = %sample.name,
                bucket_start,
                last_flush_cutoff = self.last_flush_cutoff,
                "Sample belongs to an already flushed bucket. Dropping."
            );
            self.record_discard();
            return SubmitOutcome::Late;
        }

        let context = Context::from_sample(&sample);
        let bucket = self.buckets.entry(bucket_start).or_default();
        let bucket_len = bucket.len();
        let metric = match bucket.entry(context) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !self.admission.has_room(bucket_len) {
                    trace!(context = %entry.key(), bucket_start, "Context limit reached for bucket. Dropping sample.");
                    self.telemetry.context_limit_reached();
                    return SubmitOutcome::ContextLimitReached;
                }
                entry.insert(Metric::new(sample.metric_type, true, &self.histogram_config))
            }
        };

        metric.sample(sample.value, sample.sample_weight(), sample.timestamp, now);
        self.telemetry.sample_accepted();
        SubmitOutcome::Accepted
    }

    /// Emits zero values at `timestamp` for every counter in `idle`, forgetting those that have expired.
    fn fill_counter_gaps(
        &mut self, idle: AHashMap<Context, u64>, expiry_ts: u64, timestamp: u64, out: &mut Vec<Measurement>,
    ) -> usize {
        let mut filled = 0;
        for (context, last_seen) in idle {
            if last_seen < expiry_ts {
                trace!(%context, last_seen, "Idle counter expired.");
                self.counter_last_seen.remove(&context);
            } else {
                out.push(zero_value_counter(&context, timestamp));
                filled += 1;
            }
        }
        filled
    }

    /// Records the newest flushed rate sample for `context`, keeping an existing baseline that is newer.
    fn update_rate_baseline(&mut self, context: Context, timestamp: u64, value: f64, last_seen: u64) {
        match self.rate_baselines.entry(context) {
            Entry::Occupied(mut entry) => {
                let baseline = entry.get_mut();
                baseline.last_seen = baseline.last_seen.max(last_seen);
                if timestamp >= baseline.timestamp {
                    baseline.timestamp = timestamp;
                    baseline.value = value;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(RateBaseline {
                    timestamp,
                    value,
                    last_seen,
                });
            }
        }
    }

    fn context_count_inner(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.len()).sum()
    }
}

impl MetricAggregator for BucketedAggregator {
    fn submit_metric(&mut self, sample: MetricSample) -> SubmitOutcome {
        let now = self.clock.unix_timestamp();
        self.submit_at(sample, now)
    }

    fn flush_at(&mut self, now: u64) -> Vec<Measurement> {
        let cutoff = self.bucket_start(now);
        let expiry_ts = now.saturating_sub(self.expiry_secs);
        let mut measurements = Vec::new();
        let mut zero_values = 0;
        let mut expired = 0;

        // Everything at or after the cutoff stays open; the rest is detached and flushed oldest first.
        let open = self.buckets.split_off(&cutoff);
        let closed = std::mem::replace(&mut self.buckets, open);
        let flushed_any = !closed.is_empty();

        for (bucket_start, contexts) in closed {
            debug!(bucket_start, contexts = contexts.len(), "Flushing bucket.");

            let mut idle_counters = self.counter_last_seen.clone();
            for (context, mut metric) in contexts {
                if metric.last_sample_time() < expiry_ts {
                    trace!(%context, bucket_start, "Context expired before its bucket was flushed.");
                    idle_counters.remove(&context);
                    self.counter_last_seen.remove(&context);
                    self.rate_baselines.remove(&context);
                    expired += 1;
                    continue;
                }

                if let Some(baseline) = self.rate_baselines.get(&context) {
                    if baseline.last_seen >= expiry_ts {
                        metric.seed_rate_baseline((baseline.timestamp, baseline.value));
                    }
                }

                metric.flush(&context, bucket_start, self.interval_secs, &mut measurements);
                if metric.is_counter() {
                    idle_counters.remove(&context);
                    self.counter_last_seen.insert(context, metric.last_sample_time());
                } else if let Some((timestamp, value)) = metric.latest_rate_sample() {
                    self.update_rate_baseline(context, timestamp, value, metric.last_sample_time());
                }
            }

            zero_values += self.fill_counter_gaps(idle_counters, expiry_ts, bucket_start, &mut measurements);
        }

        if !flushed_any && cutoff >= self.last_flush_cutoff.saturating_add(self.interval_secs) {
            let idle_counters = self.counter_last_seen.clone();
            let timestamp = cutoff - self.interval_secs;
            zero_values += self.fill_counter_gaps(idle_counters, expiry_ts, timestamp, &mut measurements);
        }

        self.rate_baselines.retain(|_, baseline| baseline.last_seen >= expiry_ts);
        self.last_flush_cutoff = self.last_flush_cutoff.max(cutoff);

        if self.stale_since_flush > 0 {
            warn!(
                discarded = self.stale_since_flush,
                "Discarded samples that were too old or arrived after their bucket was flushed."
            );
            self.stale_since_flush = 0;
        }

        if zero_values > 0 {
            debug!(zero_values, "Flushed zero-value counters.");
        }

        self.telemetry.contexts_expired(expired);
        self.telemetry.zero_value_counters_flushed(zero_values);
        self.telemetry.measurements_flushed(measurements.len());
        self.telemetry.set_active_contexts(self.context_count_inner());

        measurements
    }

    fn flush(&mut self) -> Vec<Measurement> {
        let now = self.clock.unix_timestamp();
        self.flush_at(now)
    }

    fn context_count(&self) -> usize {
        self.context_count_inner()
    }
}

const fn align_to_bucket_start(timestamp: u64, interval_secs: u64) -> u64 {
    timestamp - (timestamp % interval_secs)
}

#[cfg(test)]
mod tests {
    use monagent_core::{data_model::Dimensions, time::ManualClock};

    use super::*;

    const WIDTH: u64 = 10;
    const BASE: u64 = 1_700_000_000;

    fn aggregator(config: AggregateConfiguration) -> (BucketedAggregator, ManualClock) {
        let clock = ManualClock::new(BASE);
        let aggregator = BucketedAggregator::from_parts(
            &config.with_interval_secs(WIDTH),
            Arc::new(clock.clone()),
            Telemetry::noop(),
        );
        (aggregator, clock)
    }

    fn summary(measurements: &[Measurement]) -> Vec<(String, u64, f64)> {
        let mut summary = measurements
            .iter()
            .map(|m| (m.name.clone(), m.timestamp, m.value))
            .collect::<Vec<_>>();
        summary.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        summary
    }

    fn entry(name: &str, timestamp: u64, value: f64) -> (String, u64, f64) {
        (name.to_string(), timestamp, value)
    }

    #[test]
    fn open_bucket_is_not_flushed() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 3);
        aggregator.gauge("cpu.pct", 42.0, Dimensions::new());

        clock.set(BASE + 9);
        assert!(aggregator.flush().is_empty());

        clock.set(BASE + WIDTH);
        assert_eq!(summary(&aggregator.flush()), vec![entry("cpu.pct", BASE, 42.0)]);
        assert_eq!(aggregator.context_count(), 0);
    }

    #[test]
    fn out_of_order_samples_land_in_their_own_bucket() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 15);
        aggregator.submit_metric(MetricSample::gauge("temp", 2.0).with_timestamp(BASE + 12));
        aggregator.submit_metric(MetricSample::gauge("temp", 1.0).with_timestamp(BASE + 4));
        aggregator.submit_metric(MetricSample::gauge("temp", 3.0).with_timestamp(BASE + 18));

        clock.set(BASE + 25);
        assert_eq!(
            summary(&aggregator.flush()),
            vec![entry("temp", BASE, 1.0), entry("temp", BASE + WIDTH, 3.0)]
        );
    }

    #[test]
    fn bucket_is_flushed_exactly_once() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 5);
        aggregator.gauge("temp", 1.0, Dimensions::new());

        clock.set(BASE + WIDTH);
        assert_eq!(aggregator.flush().len(), 1);

        // A late sample for the bucket that was just flushed must not produce a second point for it.
        let outcome = aggregator.submit_metric(MetricSample::gauge("temp", 9.0).with_timestamp(BASE + 6));
        assert_eq!(outcome, SubmitOutcome::Late);
        assert_eq!(aggregator.discarded_stale_samples(), 1);

        clock.set(BASE + 2 * WIDTH);
        assert!(aggregator.flush().is_empty());
    }

    #[test]
    fn counters_fill_gaps_until_expiry() {
        let config = AggregateConfiguration::with_defaults().with_expiry_secs(25);
        let (mut aggregator, clock) = aggregator(config);

        clock.set(BASE + 5);
        aggregator.increment("req.count", 20.0, Dimensions::new());

        clock.set(BASE + WIDTH);
        assert_eq!(summary(&aggregator.flush()), vec![entry("req.count", BASE, 2.0)]);

        // A closed bucket holding other contexts: the idle counter reports zero for it.
        clock.set(BASE + 15);
        aggregator.gauge("temp", 1.0, Dimensions::new());
        clock.set(BASE + 2 * WIDTH);
        assert_eq!(
            summary(&aggregator.flush()),
            vec![entry("req.count", BASE + WIDTH, 0.0), entry("temp", BASE + WIDTH, 1.0)]
        );

        // No buckets at all, but an interval has passed: still one zero value.
        clock.set(BASE + 3 * WIDTH);
        assert_eq!(summary(&aggregator.flush()), vec![entry("req.count", BASE + 2 * WIDTH, 0.0)]);

        // Same interval again: nothing new to report.
        clock.set(BASE + 3 * WIDTH + 5);
        assert!(aggregator.flush().is_empty());

        // Last sampled at BASE + 5, so expired once now - 25 passes it.
        clock.set(BASE + 4 * WIDTH);
        assert!(aggregator.flush().is_empty());
        assert!(aggregator.counter_last_seen.is_empty());
    }

    #[test]
    fn resampled_counter_is_not_zero_filled() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 5);
        aggregator.increment("req.count", 10.0, Dimensions::new());
        clock.set(BASE + 15);
        aggregator.increment("req.count", 30.0, Dimensions::new());

        clock.set(BASE + 2 * WIDTH);
        assert_eq!(
            summary(&aggregator.flush()),
            vec![entry("req.count", BASE, 1.0), entry("req.count", BASE + WIDTH, 3.0)]
        );
    }

    #[test]
    fn rates_sampled_once_per_bucket_are_emitted() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        let mut emitted = Vec::new();
        for (i, value) in [100.0, 150.0, 200.0, 250.0].into_iter().enumerate() {
            let bucket_start = BASE + i as u64 * WIDTH;
            clock.set(bucket_start + 5);
            aggregator.rate("net.bytes", value, Dimensions::new());
            clock.set(bucket_start + WIDTH);
            emitted.extend(aggregator.flush());
        }

        assert_eq!(
            summary(&emitted),
            vec![
                entry("net.bytes", BASE + WIDTH, 5.0),
                entry("net.bytes", BASE + 2 * WIDTH, 5.0),
                entry("net.bytes", BASE + 3 * WIDTH, 5.0),
            ]
        );
    }

    #[test]
    fn rates_flushed_together_chain_through_their_buckets() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 5);
        aggregator.rate("net.bytes", 100.0, Dimensions::new());
        clock.set(BASE + 15);
        aggregator.rate("net.bytes", 300.0, Dimensions::new());

        clock.set(BASE + 2 * WIDTH);
        assert_eq!(summary(&aggregator.flush()), vec![entry("net.bytes", BASE + WIDTH, 20.0)]);
    }

    #[test]
    fn rate_baseline_expires_with_its_context() {
        let config = AggregateConfiguration::with_defaults().with_expiry_secs(25);
        let (mut aggregator, clock) = aggregator(config);
        clock.set(BASE + 5);
        aggregator.rate("net.bytes", 100.0, Dimensions::new());
        clock.set(BASE + WIDTH);
        assert!(aggregator.flush().is_empty());
        assert_eq!(aggregator.rate_baselines.len(), 1);

        // Resampled long after the baseline went stale: no rate against the old value.
        clock.set(BASE + 105);
        aggregator.rate("net.bytes", 900.0, Dimensions::new());
        clock.set(BASE + 110);
        assert!(aggregator.flush().is_empty());

        // The fresh sample is the new baseline.
        clock.set(BASE + 115);
        aggregator.rate("net.bytes", 1000.0, Dimensions::new());
        clock.set(BASE + 120);
        assert_eq!(summary(&aggregator.flush()), vec![entry("net.bytes", BASE + 110, 10.0)]);

        clock.set(BASE + 200);
        aggregator.flush();
        assert!(aggregator.rate_baselines.is_empty());
    }

    #[test]
    fn gauges_do_not_fill_gaps() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 5);
        aggregator.gauge("temp", 1.0, Dimensions::new());
        clock.set(BASE + WIDTH);
        assert_eq!(aggregator.flush().len(), 1);

        clock.set(BASE + 3 * WIDTH);
        assert!(aggregator.flush().is_empty());
    }

    #[test]
    fn expired_bucket_contexts_are_dropped() {
        let config = AggregateConfiguration::with_defaults().with_expiry_secs(300);
        let (mut aggregator, clock) = aggregator(config);
        clock.set(BASE + 5);
        aggregator.gauge("temp", 1.0, Dimensions::new());

        clock.set(BASE + 400);
        assert!(aggregator.flush().is_empty());
        assert_eq!(aggregator.context_count(), 0);
    }

    #[test]
    fn stale_samples_are_dropped() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults());
        clock.set(BASE + 10_000);
        let outcome = aggregator.submit_metric(MetricSample::gauge("temp", 1.0).with_timestamp(BASE));
        assert_eq!(outcome, SubmitOutcome::Stale);
        assert_eq!(aggregator.context_count(), 0);
    }

    #[test]
    fn context_limit_is_per_bucket() {
        let (mut aggregator, clock) = aggregator(AggregateConfiguration::with_defaults().with_context_limit(1));
        clock.set(BASE + 5);
        assert_eq!(aggregator.gauge("a", 1.0, Dimensions::new()), SubmitOutcome::Accepted);
        assert_eq!(
            aggregator.gauge("b", 1.0, Dimensions::new()),
            SubmitOutcome::ContextLimitReached
        );

        clock.set(BASE + 15);
        assert_eq!(aggregator.gauge("b", 1.0, Dimensions::new()), SubmitOutcome::Accepted);
    }
}
