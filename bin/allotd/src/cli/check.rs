use std::fmt;

use allot_config::GenericConfiguration;
use allot_core::{PendingUsages, Quota, QuotaError};
use allot_error::{ErrorContext as _, GenericError};
use clap::Args;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::print_json;
use crate::seed::{parse_amounts, parse_pairs, scope_key, Environment, ACTOR};

/// Runs an admission check.
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// Quota kind to check.
    #[arg(long, short = 'k')]
    pub kind: String,

    /// Scope of the request, as `field=value` pairs (`domain_id=d1,tenant_id=t1`).
    #[arg(long, short = 's')]
    pub scope: String,

    /// Requested amounts, as `field=amount` pairs (`cpu=2,memory=512`).
    #[arg(long, short = 'd')]
    pub delta: String,

    /// Reserves the request as pending usage when it fits, then rolls the reservation back.
    #[arg(long)]
    pub reserve: bool,
}

/// The checked request does not fit within its limits.
///
/// Returned by [`handle_check_command`] after the denial has been printed.
#[derive(Debug)]
pub struct RequestDenied;

impl fmt::Display for RequestDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request denied")
    }
}

impl std::error::Error for RequestDenied {}

/// Entrypoint for the `check` command.
///
/// Prints the scope's usage including the request when it fits. When it does not, prints every exceeded field and
/// returns [`RequestDenied`].
pub async fn handle_check_command(config: &GenericConfiguration, command: CheckCommand) -> Result<(), GenericError> {
    let env = Environment::from_configuration(config).await?;
    let manager = env.manager(&command.kind)?;

    let scope = parse_pairs(&command.scope).error_context("Invalid --scope.")?;
    let amounts = parse_amounts(&command.delta).error_context("Invalid --delta.")?;
    let key = scope_key(manager.schema().layer(), &scope)?;
    let delta = Quota::from_pairs(manager.schema(), key, amounts.iter().map(|(f, v)| (f, *v)))?;

    let outcome = if command.reserve {
        let mut pending = PendingUsages::new();
        let outcome = manager.reserve(ACTOR, &mut pending, &delta).await;
        pending.cancel_all(env.registry(), ACTOR).await?;
        outcome
    } else {
        manager.check_quota(ACTOR, &delta).await
    };

    match outcome {
        Ok(used) => {
            info!(kind = %command.kind, scope = %delta.key(), "Request admitted.");
            print_json(&json!({
                "admitted": true,
                "kind": command.kind,
                "scope": delta.key().to_string(),
                "used": Value::Object(used.to_json(None)),
            }));
            Ok(())
        }
        Err(e @ QuotaError::OutOfQuota { .. }) => {
            warn!(kind = %command.kind, scope = %delta.key(), error = %e, "Request denied.");
            print_json(&denial(&command.kind, &e));
            Err(RequestDenied.into())
        }
        Err(e) => Err(GenericError::from(e).context("Admission check failed. The request must be treated as denied.")),
    }
}

fn denial(kind: &str, error: &QuotaError) -> Value {
    let exceeded = error
        .exceeded()
        .unwrap_or_default()
        .iter()
        .map(|field| {
            json!({
                "scope": field.scope.to_string(),
                "field": field.field,
                "limit": field.limit,
                "used": field.used,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "admitted": false,
        "kind": kind,
        "exceeded": exceeded,
    })
}

#[cfg(test)]
mod tests {
    use allot_config::ConfigurationLoader;

    use super::*;

    const CONFIG: &str = r#"
quota:
  kinds:
    - name: compute
      layer: project
      fields:
        - { name: cpu, default: 10 }
seed:
  usage:
    - kind: compute
      scope: { domain_id: d1, tenant_id: t1 }
      values: { cpu: 6 }
"#;

    fn check(delta: &str, reserve: bool) -> CheckCommand {
        CheckCommand {
            kind: "compute".to_string(),
            scope: "domain_id=d1,tenant_id=t1".to_string(),
            delta: delta.to_string(),
            reserve,
        }
    }

    #[tokio::test]
    async fn denial_is_returned_to_the_caller() {
        let config = ConfigurationLoader::default().from_yaml_str(CONFIG).unwrap().into_generic();

        handle_check_command(&config, check("cpu=4", false)).await.unwrap();
        handle_check_command(&config, check("cpu=4", true)).await.unwrap();

        let err = handle_check_command(&config, check("cpu=5", true)).await.unwrap_err();
        assert!(err.is::<RequestDenied>());

        let err = handle_check_command(&config, check("gpu=1", false)).await.unwrap_err();
        assert!(!err.is::<RequestDenied>());
    }
}
