use metrics::{Counter, Gauge};
use monagent_core::observability::MetricsBuilder;

#[derive(Clone)]
pub struct Telemetry {
    active_contexts: Gauge,
    samples_accepted: Counter,
    stale_samples_dropped: Counter,
    context_limit_dropped: Counter,
    contexts_expired: Counter,
    measurements_flushed: Counter,
    zero_value_counters_flushed: Counter,
}

impl Telemetry {
    pub fn new(builder: &MetricsBuilder) -> Self {
        Self {
            active_contexts: builder.register_gauge("aggregate_active_contexts"),
            samples_accepted: builder.register_counter("aggregate_samples_accepted_total"),
            stale_samples_dropped: builder.register_counter_with_tags("aggregate_samples_dropped_total", ["reason:stale"]),
            context_limit_dropped: builder
                .register_counter_with_tags("aggregate_samples_dropped_total", ["reason:context_limit"]),
            contexts_expired: builder.register_counter("aggregate_contexts_expired_total"),
            measurements_flushed: builder.register_counter("aggregate_measurements_flushed_total"),
            zero_value_counters_flushed: builder.register_counter("aggregate_zero_value_counters_flushed_total"),
        }
    }

    #[cfg(test)]
    pub fn noop() -> Self {
        Self {
            active_contexts: Gauge::noop(),
            samples_accepted: Counter::noop(),
            stale_samples_dropped: Counter::noop(),
            context_limit_dropped: Counter::noop(),
            contexts_expired: Counter::noop(),
            measurements_flushed: Counter::noop(),
            zero_value_counters_flushed: Counter::noop(),
        }
    }

    pub fn set_active_contexts(&self, len: usize) {
        self.active_contexts.set(len as f64);
    }

    pub fn sample_accepted(&self) {
        self.samples_accepted.increment(1);
    }

    pub fn stale_sample_dropped(&self) {
        self.stale_samples_dropped.increment(1);
    }

    pub fn context_limit_reached(&self) {
        self.context_limit_dropped.increment(1);
    }

    pub fn contexts_expired(&self, n: usize) {
        self.contexts_expired.increment(n as u64);
    }

    pub fn measurements_flushed(&self, n: usize) {
        self.measurements_flushed.increment(n as u64);
    }

    pub fn zero_value_counters_flushed(&self, n: usize) {
        self.zero_value_counters_flushed.increment(n as u64);
    }
}
