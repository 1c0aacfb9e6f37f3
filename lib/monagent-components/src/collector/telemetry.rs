use std::time::Duration;

use metrics::{Counter, Histogram};
use monagent_core::observability::MetricsBuilder;

#[derive(Clone)]
pub struct Telemetry {
    runs: Counter,
    check_failures: Counter,
    collection_time: Histogram,
    emit_time: Histogram,
}

impl Telemetry {
    pub fn new(builder: &MetricsBuilder) -> Self {
        Self {
            runs: builder.register_counter("collector_runs_total"),
            check_failures: builder.register_counter("collector_check_failures_total"),
            collection_time: builder.register_histogram("collector_collection_time_seconds"),
            emit_time: builder.register_histogram("collector_emit_time_seconds"),
        }
    }

    pub fn run_completed(&self, collection_time: Duration, emit_time: Duration) {
        self.runs.increment(1);
        self.collection_time.record(collection_time.as_secs_f64());
        self.emit_time.record(emit_time.as_secs_f64());
    }

    pub fn check_failed(&self) {
        self.check_failures.increment(1);
    }
}
