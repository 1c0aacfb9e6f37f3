//! Host monitoring agent.
//!
//! Runs a set of checks on a fixed period, aggregates what they submit, and forwards the resulting measurements to a
//! metrics endpoint.

use clap::Parser as _;
use monagent_app::prelude::*;
use tracing::{error, info};

mod config;
use self::config::{Action, Cli};

mod heartbeat;

mod run;
use self::run::{check_configuration, load_configuration, run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match load_configuration(&cli.config) {
        Ok(configuration) => configuration,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {:#}", e)),
    };

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => fatal_and_exit(format!("invalid logging configuration: {:#}", e)),
    };

    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match cli.action.unwrap_or_default() {
        Action::Run => match run(configuration).await {
            Ok(()) => info!("Agent stopped."),
            Err(e) => {
                error!("{:?}", e);
                std::process::exit(1);
            }
        },
        Action::CheckConfig => match check_configuration(&configuration) {
            Ok(()) => info!(config_path = %cli.config.display(), "Configuration is valid."),
            Err(e) => {
                error!("{:#}", e);
                std::process::exit(1);
            }
        },
    }
}
