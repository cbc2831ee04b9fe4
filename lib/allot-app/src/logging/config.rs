use allot_config::GenericConfiguration;
use allot_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
///
/// Read from the top level of the configuration, so `ALLOT_LOG_LEVEL` and `ALLOT_LOG_FORMAT_JSON` apply when
/// environment variables are loaded with the `allot` prefix.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde(default)]
    log_format_json: bool,

    #[serde(default = "default_true")]
    log_to_console: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }

    /// Returns the filter built from the configured log level directives.
    pub fn env_filter(&self) -> EnvFilter {
        self.log_level.0.clone()
    }

    /// Returns `true` if events are formatted as JSON.
    pub const fn log_format_json(&self) -> bool {
        self.log_format_json
    }

    /// Returns `true` if events are written to standard error.
    pub const fn log_to_console(&self) -> bool {
        self.log_to_console
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

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use allot_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("quota: {}")
            .unwrap()
            .into_generic();
        let logging = LoggingConfiguration::from_configuration(&config).unwrap();

        assert!(!logging.log_format_json());
        assert!(logging.log_to_console());
        assert!(logging.env_filter().to_string().contains("info"));
    }

    #[test]
    fn directives_are_parsed() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("log_level: \"allot_core=debug,warn\"\nlog_format_json: true")
            .unwrap()
            .into_generic();
        let logging = LoggingConfiguration::from_configuration(&config).unwrap();

        assert!(logging.log_format_json());
        let rendered = logging.env_filter().to_string();
        assert!(rendered.contains("allot_core=debug"));
    }

    #[test]
    fn empty_level_rejected() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("log_level: \"\"")
            .unwrap()
            .into_generic();
        assert!(LoggingConfiguration::from_configuration(&config).is_err());
    }
}
