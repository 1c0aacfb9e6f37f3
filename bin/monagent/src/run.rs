use std::{path::Path, sync::Arc};

use monagent_components::{
    aggregate::{build_aggregator, AggregateConfiguration},
    collector::{Collector, CollectorConfiguration},
    forwarder::{build_endpoint, ForwarderConfiguration, TransactionManager},
};
use monagent_config::{ConfigurationLoader, GenericConfiguration};
use monagent_core::time::{Clock, SystemClock};
use monagent_error::{ErrorContext as _, GenericError};
use tokio::{select, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config::AgentConfiguration, heartbeat::HeartbeatCheck};

/// Loads the configuration file at `path`, if present, overlaid with `MONAGENT_`-prefixed environment variables.
pub fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment("MONAGENT")?
        .into_generic();
    Ok(configuration)
}

/// Validates every component's configuration.
pub fn check_configuration(configuration: &GenericConfiguration) -> Result<(), GenericError> {
    AgentConfiguration::from_configuration(configuration).error_context("Invalid agent configuration.")?;
    AggregateConfiguration::from_configuration(configuration).error_context("Invalid aggregator configuration.")?;
    CollectorConfiguration::from_configuration(configuration).error_context("Invalid collector configuration.")?;

    let forwarder_config =
        ForwarderConfiguration::from_configuration(configuration).error_context("Invalid forwarder configuration.")?;
    build_endpoint(&forwarder_config)?;

    Ok(())
}

/// Runs the agent until interrupted.
pub async fn run(configuration: GenericConfiguration) -> Result<(), GenericError> {
    let agent_config = AgentConfiguration::from_configuration(&configuration)?;
    let aggregate_config = AggregateConfiguration::from_configuration(&configuration)?;
    let forwarder_config = ForwarderConfiguration::from_configuration(&configuration)?;
    let collector_config = CollectorConfiguration::from_configuration(&configuration)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let aggregator = build_aggregator(&aggregate_config, agent_config.bucketed_aggregation, Arc::clone(&clock));

    let endpoint = build_endpoint(&forwarder_config)?;
    let forwarder = Arc::new(TransactionManager::new(&forwarder_config, endpoint));

    let mut collector = Collector::new(collector_config, Arc::clone(&forwarder), Arc::clone(&clock))
        .with_aggregator(aggregator.clone());
    collector.add_check(HeartbeatCheck::new(aggregator, clock))?;

    let shutdown = CancellationToken::new();
    let mut forwarder_task = tokio::spawn(Arc::clone(&forwarder).run(forwarder_config.flush_interval(), shutdown.clone()));
    let mut collector_task = tokio::spawn(collector.run(shutdown.clone()));

    info!("Agent running, waiting for interrupt...");

    select! {
        result = tokio::signal::ctrl_c() => {
            result.error_context("Failed to listen for shutdown signal.")?;
            info!("Shutdown signal received. Stopping...");
        }
        _ = &mut collector_task => error!("Collector unexpectedly finished. Shutting down..."),
        _ = &mut forwarder_task => error!("Forwarder unexpectedly finished. Shutting down..."),
    }

    shutdown.cancel();
    if !collector_task.is_finished() {
        collector_task.await.error_context("Collector task failed.")?;
    }
    if !forwarder_task.is_finished() {
        forwarder_task.await.error_context("Forwarder task failed.")?;
    }

    // One last attempt at whatever is still queued, with a fresh token so the flush is not cut short immediately.
    match timeout(agent_config.shutdown_timeout(), forwarder.flush(&CancellationToken::new())).await {
        Ok(summary) => info!(
            delivered = summary.succeeded,
            remaining = forwarder.len(),
            "Final flush complete."
        ),
        Err(_) => warn!(remaining = forwarder.len(), "Final flush timed out."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use monagent_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_configuration_passes() {
        let configuration = ConfigurationLoader::for_tests(Some(json!({
            "forwarder_url": "http://localhost:8070/v2.0/metrics",
            "collector_interval": 30,
        })));
        check_configuration(&configuration).unwrap();
    }

    #[test]
    fn invalid_configuration_is_reported() {
        let configuration = ConfigurationLoader::for_tests(Some(json!({
            "forwarder_url": "not a url",
        })));
        assert!(check_configuration(&configuration).is_err());

        let configuration = ConfigurationLoader::for_tests(Some(json!({
            "collector_interval": "soon",
        })));
        let error = check_configuration(&configuration).unwrap_err();
        assert!(format!("{:#}", error).contains("collector"));
    }
}
