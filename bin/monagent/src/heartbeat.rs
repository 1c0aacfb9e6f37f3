use std::sync::Arc;

use async_trait::async_trait;
use monagent_components::{aggregate::AggregatorHandle, collector::Check};
use monagent_core::{
    data_model::{Dimensions, Measurement},
    time::Clock,
};
use monagent_error::GenericError;
use tokio::time::Instant;
use tracing::trace;

/// Built-in liveness check.
///
/// Submits a `monagent.heartbeat` gauge and a `monagent.heartbeat.count` counter through the shared aggregator, and
/// reports the agent's uptime directly as a finished measurement.
pub struct HeartbeatCheck {
    aggregator: AggregatorHandle,
    clock: Arc<dyn Clock>,
    started: Instant,
    buffered: Vec<Measurement>,
}

impl HeartbeatCheck {
    pub fn new(aggregator: AggregatorHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            aggregator,
            clock,
            started: Instant::now(),
            buffered: Vec::new(),
        }
    }
}

#[async_trait]
impl Check for HeartbeatCheck {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&mut self) -> Result<(), GenericError> {
        self.aggregator.gauge("monagent.heartbeat", 1.0, Dimensions::new());
        self.aggregator.increment("monagent.heartbeat.count", 1.0, Dimensions::new());

        let uptime = self.started.elapsed().as_secs_f64();
        self.buffered
            .push(Measurement::new("monagent.uptime_sec", self.clock.unix_timestamp(), uptime));

        trace!(uptime, "Emitted heartbeat.");
        Ok(())
    }

    fn get_metrics(&mut self) -> Vec<Measurement> {
        std::mem::take(&mut self.buffered)
    }
}
