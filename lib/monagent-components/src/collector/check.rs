use async_trait::async_trait;
use monagent_core::data_model::{Event, Measurement};
use monagent_error::GenericError;

/// A unit of collection logic, run once per collector run.
///
/// A check does its work in [`run`][Check::run] and buffers what it finds. The collector then drains the buffers with
/// [`get_metrics`][Check::get_metrics] and [`get_events`][Check::get_events]. Checks that would rather submit raw samples
/// for aggregation can hold an [`AggregatorHandle`][crate::aggregate::AggregatorHandle] instead, and return nothing
/// from `get_metrics`.
#[async_trait]
pub trait Check: Send {
    /// Returns the name of the check, unique within a collector.
    fn name(&self) -> &str;

    /// Runs the check.
    ///
    /// # Errors
    ///
    /// If the check fails, an error is returned. Anything buffered during a failed run is discarded.
    async fn run(&mut self) -> Result<(), GenericError>;

    /// Takes the measurements buffered since the last call.
    fn get_metrics(&mut self) -> Vec<Measurement>;

    /// Takes the events buffered since the last call.
    fn get_events(&mut self) -> Vec<Event> {
        Vec::new()
    }

    /// Releases any resources held by the check. Called once, when the collector stops.
    fn stop(&mut self) {}
}
