//! Operator CLI for hierarchical quotas.
//!
//! Loads quota kinds and seed data from a YAML configuration file, then runs admission checks, prints reports, or keeps
//! usage reconcilers running until interrupted.

#![deny(missing_docs)]
use std::path::Path;

use allot_app::{logging::LoggingConfiguration, prelude::*};
use allot_config::{ConfigurationLoader, GenericConfiguration};
use allot_error::{ErrorContext as _, GenericError};
use clap::Parser as _;
use tracing::error;

mod cli;
use self::cli::{
    handle_check_command, handle_list_command, handle_relation_command, handle_run_command, handle_show_command,
    Action, Cli, RequestDenied,
};

mod seed;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match load_configuration(cli.config.as_deref()) {
        Ok(configuration) => configuration,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {:?}", e)),
    };

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("invalid logging configuration: {}", e)),
    };
    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    let result = match cli.action {
        Action::Check(command) => handle_check_command(&configuration, command).await,
        Action::Show(command) => handle_show_command(&configuration, command).await,
        Action::List(command) => handle_list_command(&configuration, command).await,
        Action::Relation(command) => handle_relation_command(command),
        Action::Run(command) => handle_run_command(&configuration, command).await,
    };

    if let Err(e) = result {
        // A denial was already printed.
        if !e.is::<RequestDenied>() {
            error!("{:?}", e);
        }
        std::process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = path {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to read configuration file '{}'.", path.display()))?;
    }

    let configuration = loader
        .from_environment("allot")
        .error_context("Failed to read configuration from the environment.")?
        .into_generic();
    Ok(configuration)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn configuration_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level: debug\nquota:\n  enforce: false").unwrap();

        let configuration = load_configuration(Some(file.path())).unwrap();
        let enforce: bool = configuration.get_typed("quota.enforce").unwrap();
        assert!(!enforce);
    }

    #[test]
    fn missing_configuration_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_configuration(Some(&dir.path().join("absent.yaml"))).is_err());
    }
}
