use allot_config::GenericConfiguration;
use allot_core::{sort_by_usage_rate, QuotaListFilter};
use allot_error::GenericError;
use clap::Args;
use serde_json::Value;

use super::print_json;
use crate::seed::Environment;

/// Lists stored quotas.
#[derive(Args, Debug)]
pub struct ListCommand {
    /// Only this kind. Every configured kind is listed by default.
    #[arg(long, short = 'k')]
    pub kind: Option<String>,

    /// Only rows of this domain.
    #[arg(long)]
    pub domain_id: Option<String>,

    /// Only rows of this project.
    #[arg(long)]
    pub tenant_id: Option<String>,

    /// Only domain-level rows.
    #[arg(long)]
    pub domain_only: bool,

    /// Only rows without platform fields.
    #[arg(long)]
    pub primary_only: bool,
}

/// Entrypoint for the `list` command.
pub async fn handle_list_command(config: &GenericConfiguration, command: ListCommand) -> Result<(), GenericError> {
    let env = Environment::from_configuration(config).await?;
    let filter = QuotaListFilter {
        domain_id: command.domain_id,
        tenant_id: command.tenant_id,
        domain_only: command.domain_only,
        primary_only: command.primary_only,
    };

    let managers = match &command.kind {
        Some(kind) => vec![env.manager(kind)?],
        None => env.registry().managers().collect(),
    };

    let mut reports = Vec::new();
    for manager in managers {
        reports.extend(manager.list_quotas(&filter).await?);
    }
    sort_by_usage_rate(&mut reports);

    let rendered = reports
        .iter()
        .map(|report| {
            let mut json = report.to_json();
            if let Value::Object(map) = &mut json {
                map.insert("kind".to_string(), Value::from(report.quota.kind()));
                map.insert("usage_rate".to_string(), Value::from(report.usage_rate()));
            }
            json
        })
        .collect::<Vec<_>>();

    print_json(&Value::Array(rendered));
    Ok(())
}
