use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use monagent_config::GenericConfiguration;
use monagent_error::GenericError;
use serde::Deserialize;

/// Host monitoring agent.
#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// A missing file is not an error: every setting can also be given through `MONAGENT_`-prefixed environment
    /// variables.
    #[arg(global = true, short = 'c', long, default_value = "/etc/monagent/agent.yaml")]
    pub config: PathBuf,

    /// Subcommand to run. Defaults to `run`.
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Subcommand)]
pub enum Action {
    /// Run the agent until interrupted.
    #[default]
    #[command(name = "run")]
    Run,

    /// Validate the configuration and exit.
    #[command(name = "check-config")]
    CheckConfig,
}

const fn default_true() -> bool {
    true
}

const fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Agent-wide settings that do not belong to a single component.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfiguration {
    /// Whether samples are aggregated into time buckets by their own timestamps.
    ///
    /// When disabled, every sample aggregates into the current interval regardless of its timestamp.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub bucketed_aggregation: bool,

    /// How long the final flush on shutdown may take, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "shutdown_timeout", default = "default_shutdown_timeout_secs")]
    shutdown_timeout_secs: u64,
}

impl AgentConfiguration {
    /// Reads the agent configuration from `config`.
    ///
    /// # Errors
    ///
    /// If any agent key is present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Returns the final flush timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use monagent_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    #[test]
    fn run_is_the_default_action() {
        let cli = Cli::try_parse_from(["monagent"]).unwrap();
        assert_eq!(cli.action.unwrap_or_default(), Action::Run);
        assert_eq!(cli.config, PathBuf::from("/etc/monagent/agent.yaml"));
    }

    #[test]
    fn check_config_with_custom_path() {
        let cli = Cli::try_parse_from(["monagent", "check-config", "--config", "/tmp/agent.yaml"]).unwrap();
        assert_eq!(cli.action, Some(Action::CheckConfig));
        assert_eq!(cli.config, PathBuf::from("/tmp/agent.yaml"));
    }

    #[test]
    fn agent_configuration() {
        let defaults = AgentConfiguration::from_configuration(&ConfigurationLoader::for_tests(None)).unwrap();
        assert!(defaults.bucketed_aggregation);
        assert_eq!(defaults.shutdown_timeout(), Duration::from_secs(10));

        let config = AgentConfiguration::from_configuration(&ConfigurationLoader::for_tests(Some(json!({
            "bucketed_aggregation": false,
            "shutdown_timeout": 3,
        }))))
        .unwrap();
        assert!(!config.bucketed_aggregation);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
    }
}
