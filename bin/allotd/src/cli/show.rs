use allot_config::GenericConfiguration;
use allot_error::{ErrorContext as _, GenericError};
use clap::Args;

use super::print_json;
use crate::seed::{parse_pairs, scope_key, Environment};

/// Shows one scope.
#[derive(Args, Debug)]
pub struct ShowCommand {
    /// Quota kind to show.
    #[arg(long, short = 'k')]
    pub kind: String,

    /// Scope to show, as `field=value` pairs. Omit for the system scope.
    #[arg(long, short = 's', default_value = "")]
    pub scope: String,

    /// Recomputes usage from ground truth before reporting.
    #[arg(long)]
    pub refresh: bool,
}

/// Entrypoint for the `show` command.
pub async fn handle_show_command(config: &GenericConfiguration, command: ShowCommand) -> Result<(), GenericError> {
    let env = Environment::from_configuration(config).await?;
    let manager = env.manager(&command.kind)?;

    let scope = parse_pairs(&command.scope).error_context("Invalid --scope.")?;
    let key = scope_key(manager.schema().layer(), &scope)?;
    let report = manager
        .describe(&key, command.refresh)
        .await
        .with_error_context(|| format!("Failed to describe {} quota of {}.", command.kind, key))?;

    print_json(&report.to_json());
    Ok(())
}
