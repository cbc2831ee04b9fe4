//! Logging.

use allot_error::GenericError;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::LoggingConfiguration;

mod layer;
use self::layer::build_formatting_layer;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by the configured log level directives (`log_level`, default `info`) and written to standard
/// error, either as JSON (`log_format_json: true`) or in a pipe-delimited, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let mut configured_layers = Vec::new();
    if config.log_to_console() {
        configured_layers.push(build_formatting_layer(config, std::io::stderr));
    }

    tracing_subscriber::registry()
        .with(configured_layers.with_filter(config.env_filter()))
        .try_init()?;

    Ok(())
}
