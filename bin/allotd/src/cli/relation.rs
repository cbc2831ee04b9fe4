use allot_core::KeyLayer;
use allot_error::{generic_error, ErrorContext as _, GenericError};
use clap::Args;
use serde_json::json;

use super::print_json;
use crate::seed::{parse_pairs, scope_key};

/// Compares two scope keys.
#[derive(Args, Debug)]
pub struct RelationCommand {
    /// Key layer of both keys: `domain`, `project`, `domain_cloud`, `project_cloud`, `domain_region`,
    /// `project_region` or `project_zone`.
    #[arg(long, short = 'l', default_value = "project")]
    pub layer: String,

    /// Left key, as `field=value` pairs.
    pub left: String,

    /// Right key, as `field=value` pairs.
    pub right: String,
}

/// Entrypoint for the `relation` command.
pub fn handle_relation_command(command: RelationCommand) -> Result<(), GenericError> {
    let layer = command
        .layer
        .parse::<KeyLayer>()
        .map_err(|e| generic_error!("Invalid --layer '{}': {}", command.layer, e))?;

    let left = scope_key(layer, &parse_pairs(&command.left).error_context("Invalid left key.")?)?;
    let right = scope_key(layer, &parse_pairs(&command.right).error_context("Invalid right key.")?)?;

    print_json(&json!({
        "left": left.to_string(),
        "right": right.to_string(),
        "relation": format!("{:?}", left.relation(&right)),
        "order": format!("{:?}", left.specificity_cmp(&right)),
        "left_weight": left.weight(),
        "right_weight": right.weight(),
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use allot_core::KeyLayer;
    use clap::CommandFactory as _;

    use crate::cli::Cli;

    #[test]
    fn layer_help_lists_every_layer() {
        let command = Cli::command();
        let relation = command.find_subcommand("relation").unwrap();
        let layer = relation.get_arguments().find(|arg| arg.get_id() == "layer").unwrap();
        let help = layer.get_long_help().or(layer.get_help()).unwrap().to_string();

        for layer in KeyLayer::ALL {
            assert!(help.contains(&format!("`{}`", layer)), "missing {} in {:?}", layer, help);
            assert_eq!(layer.as_str().parse::<KeyLayer>().unwrap(), layer);
        }
    }
}
