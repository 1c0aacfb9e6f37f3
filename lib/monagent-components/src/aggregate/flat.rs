use std::{collections::hash_map::Entry, sync::Arc};

use ahash::AHashMap;
use monagent_core::{
    data_model::{Context, Measurement, MetricSample},
    observability::MetricsBuilder,
    time::Clock,
};
use tracing::{debug, trace, warn};

use super::{
    metric::Metric, telemetry::Telemetry, AggregateConfiguration, Admission, HistogramConfiguration, MetricAggregator,
    SubmitOutcome,
};

/// Aggregates samples per context, without regard to their timestamps.
///
/// Every flush emits whatever each live context has accumulated since the previous flush, stamped with the flush time
/// (gauges keep their submitted timestamp, when given one).
pub struct Aggregator {
    interval_secs: u64,
    expiry_secs: u64,
    admission: Admission,
    histogram_config: Arc<HistogramConfiguration>,
    clock: Arc<dyn Clock>,
    contexts: AHashMap<Context, Metric>,
    stale_since_flush: u64,
    stale_total: u64,
    telemetry: Telemetry,
}

impl Aggregator {
    /// Creates an aggregator.
    pub fn new(config: &AggregateConfiguration, clock: Arc<dyn Clock>) -> Self {
        let telemetry = Telemetry::new(&MetricsBuilder::for_component("aggregator").add_default_tag(("mode", "flat")));
        Self::from_parts(config, clock, telemetry)
    }

    fn from_parts(config: &AggregateConfiguration, clock: Arc<dyn Clock>, telemetry: Telemetry) -> Self {
        Self {
            interval_secs: config.interval_secs(),
            expiry_secs: config.expiry_secs,
            admission: config.admission(),
            histogram_config: Arc::new(config.histogram_config.clone()),
            clock,
            contexts: AHashMap::default(),
            stale_since_flush: 0,
            stale_total: 0,
            telemetry,
        }
    }

    /// Returns the number of samples dropped for being too old, since creation.
    pub fn discarded_stale_samples(&self) -> u64 {
        self.stale_total
    }

    fn submit_at(&mut self, sample: MetricSample, now: u64) -> SubmitOutcome {
        if self.admission.is_stale(sample.timestamp, now) {
            self.stale_since_flush += 1;
            self.stale_total += 1;
            self.telemetry.stale_sample_dropped();
            return SubmitOutcome::Stale;
        }

        let context = Context::from_sample(&sample);
        let contexts_len = self.contexts.len();
        let metric = match self.contexts.entry(context) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !self.admission.has_room(contexts_len) {
                    trace!(context = %entry.key(), "Context limit reached. Dropping sample.");
                    self.telemetry.context_limit_reached();
                    return SubmitOutcome::ContextLimitReached;
                }
                entry.insert(Metric::new(sample.metric_type, false, &self.histogram_config))
            }
        };

        metric.sample(sample.value, sample.sample_weight(), sample.timestamp, now);
        self.telemetry.sample_accepted();
        SubmitOutcome::Accepted
    }
}

impl MetricAggregator for Aggregator {
    fn submit_metric(&mut self, sample: MetricSample) -> SubmitOutcome {
        let now = self.clock.unix_timestamp();
        self.submit_at(sample, now)
    }

    fn flush_at(&mut self, now: u64) -> Vec<Measurement> {
        let expiry_ts = now.saturating_sub(self.expiry_secs);
        let interval_secs = self.interval_secs;
        let mut measurements = Vec::new();
        let mut expired = 0;

        self.contexts.retain(|context, metric| {
            if metric.last_sample_time() < expiry_ts {
                trace!(%context, last_sample_time = metric.last_sample_time(), "Context expired.");
                expired += 1;
                false
            } else {
                metric.flush(context, now, interval_secs, &mut measurements);
                true
            }
        });

        if self.stale_since_flush > 0 {
            warn!(
                discarded = self.stale_since_flush,
                "Discarded samples with timestamps older than the recent-point threshold."
            );
            self.stale_since_flush = 0;
        }

        debug!(
            timestamp = now,
            contexts = self.contexts.len(),
            expired,
            measurements = measurements.len(),
            "Flushed aggregator."
        );

        self.telemetry.contexts_expired(expired);
        self.telemetry.measurements_flushed(measurements.len());
        self.telemetry.set_active_contexts(self.contexts.len());

        measurements
    }

    fn flush(&mut self) -> Vec<Measurement> {
        let now = self.clock.unix_timestamp();
        self.flush_at(now)
    }

    fn context_count(&self) -> usize {
        self.contexts.len()
    }
}
