use std::time::Duration;

use metrics::{Counter, Gauge, Histogram};
use monagent_core::observability::MetricsBuilder;

#[derive(Clone)]
pub struct Telemetry {
    queued_transactions: Gauge,
    queued_bytes: Gauge,
    transactions_appended: Counter,
    transactions_sent: Counter,
    transactions_failed: Counter,
    transactions_evicted: Counter,
    transactions_dropped: Counter,
    bytes_sent: Counter,
    delivery_latency: Histogram,
}

impl Telemetry {
    pub fn new(builder: &MetricsBuilder) -> Self {
        Self {
            queued_transactions: builder.register_gauge("forwarder_queued_transactions"),
            queued_bytes: builder.register_gauge("forwarder_queued_bytes"),
            transactions_appended: builder.register_counter("forwarder_transactions_appended_total"),
            transactions_sent: builder.register_counter("forwarder_transactions_sent_total"),
            transactions_failed: builder.register_counter("forwarder_transactions_failed_total"),
            transactions_evicted: builder.register_counter("forwarder_transactions_evicted_total"),
            transactions_dropped: builder.register_counter("forwarder_transactions_dropped_total"),
            bytes_sent: builder.register_counter("forwarder_bytes_sent_total"),
            delivery_latency: builder.register_histogram("forwarder_delivery_latency_seconds"),
        }
    }

    pub fn set_queue_depth(&self, transactions: usize, bytes: u64) {
        self.queued_transactions.set(transactions as f64);
        self.queued_bytes.set(bytes as f64);
    }

    pub fn transaction_appended(&self) {
        self.transactions_appended.increment(1);
    }

    pub fn transaction_sent(&self, bytes: u64, latency: Duration) {
        self.transactions_sent.increment(1);
        self.bytes_sent.increment(bytes);
        self.delivery_latency.record(latency.as_secs_f64());
    }

    pub fn transaction_failed(&self) {
        self.transactions_failed.increment(1);
    }

    pub fn transactions_evicted(&self, n: usize) {
        self.transactions_evicted.increment(n as u64);
    }

    pub fn transaction_dropped(&self) {
        self.transactions_dropped.increment(1);
    }
}
