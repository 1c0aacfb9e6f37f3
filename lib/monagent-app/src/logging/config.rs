use monagent_config::GenericConfiguration;
use monagent_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit JSON instead of single-line text.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to write logs to standard output.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub log_to_console: bool,
}

impl LoggingConfiguration {
    /// Reads the logging configuration from `config`.
    ///
    /// # Errors
    ///
    /// If any logging key is present but invalid, such as an unparseable log level, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_to_console: true,
        }
    }
}

/// A parsed set of log filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns a fresh `EnvFilter` built from these directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        EnvFilter::new(self.0.to_string())
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value.to_lowercase())
            .map(Self)
            .error_context("Failed to parse log level.")
    }
}

#[cfg(test)]
mod tests {
    use monagent_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = ConfigurationLoader::for_tests(None);
        let logging = LoggingConfiguration::from_configuration(&config).unwrap();
        assert!(logging.log_to_console);
        assert!(!logging.log_format_json);
        assert_eq!(logging.log_level.as_env_filter().to_string(), "info");
    }

    #[test]
    fn uppercase_level_accepted() {
        let config = ConfigurationLoader::for_tests(Some(json!({ "log_level": "DEBUG", "log_format_json": true })));
        let logging = LoggingConfiguration::from_configuration(&config).unwrap();
        assert!(logging.log_format_json);
        assert_eq!(logging.log_level.as_env_filter().to_string(), "debug");
    }

    #[test]
    fn empty_level_rejected() {
        let config = ConfigurationLoader::for_tests(Some(json!({ "log_level": "  " })));
        assert!(LoggingConfiguration::from_configuration(&config).is_err());
    }
}
