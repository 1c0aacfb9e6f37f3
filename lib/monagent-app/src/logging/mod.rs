//! Logging.

use monagent_error::GenericError;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::LoggingConfiguration;

mod layer;
use self::layer::build_formatting_layer;

/// Writes `message` to standard error and exits the process with a non-zero exit code.
///
/// Only meant for failures that happen before logging is available.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Installs the global `tracing` subscriber.
///
/// Events are filtered by `log_level` (standard `EnvFilter` directives such as `info,monagent_components=debug`) and
/// written to standard output, either as JSON or as single-line, pipe-delimited text. When console logging is
/// disabled, the filter is still installed so that `log` crate records are routed consistently, but nothing is
/// written.
///
/// # Errors
///
/// If a global subscriber has already been installed, an error is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.as_env_filter();

    let output_layer = config
        .log_to_console
        .then(|| build_formatting_layer(config, std::io::stdout));

    tracing_subscriber::registry()
        .with(output_layer.with_filter(filter))
        .try_init()?;

    Ok(())
}
