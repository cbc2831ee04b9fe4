use allot_config::GenericConfiguration;
use allot_error::{ErrorContext as _, GenericError};
use clap::Args;
use tracing::{info, warn};

use crate::seed::Environment;

/// Runs the usage reconcilers.
#[derive(Args, Debug)]
pub struct RunCommand {
    /// Queues a recompute of every stored row before waiting.
    #[arg(long)]
    pub sweep_on_start: bool,
}

/// Entrypoint for the `run` command.
///
/// Keeps each kind's reconciler running, with its periodic sweep, until Ctrl-C is received.
pub async fn handle_run_command(config: &GenericConfiguration, command: RunCommand) -> Result<(), GenericError> {
    let env = Environment::from_configuration(config).await?;
    info!(kinds = ?env.registry().kinds(), "Quota reconcilers running.");

    if command.sweep_on_start {
        for manager in env.registry().managers() {
            match manager.sweep().await {
                Ok(queued) => info!(kind = manager.kind(), queued, "Queued initial sweep."),
                Err(e) => warn!(kind = manager.kind(), error = %e, "Failed to queue initial sweep."),
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for shutdown signal.")?;

    let dirty = env
        .registry()
        .managers()
        .map(|manager| manager.reconciler().dirty_len())
        .sum::<usize>();
    info!(dirty, "Received shutdown signal. Stopping.");
    Ok(())
}
