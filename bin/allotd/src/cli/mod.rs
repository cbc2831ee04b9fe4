use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod check;
pub use self::check::{handle_check_command, CheckCommand, RequestDenied};

mod list;
pub use self::list::{handle_list_command, ListCommand};

mod relation;
pub use self::relation::{handle_relation_command, RelationCommand};

mod run;
pub use self::run::{handle_run_command, RunCommand};

mod show;
pub use self::show::{handle_show_command, ShowCommand};

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// Declares quota kinds under `quota` and, optionally, rows to load at startup under `seed`. Settings can also be
    /// given as `ALLOT_`-prefixed environment variables.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Checks whether a request fits within the limits of its scope and every ancestor.
    Check(CheckCommand),

    /// Shows limits, usage and pending reservations of one scope.
    Show(ShowCommand),

    /// Lists stored quotas, highest usage rate first.
    List(ListCommand),

    /// Prints how two scope keys relate.
    Relation(RelationCommand),

    /// Runs the usage reconcilers until interrupted.
    Run(RunCommand),
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{}", rendered),
        Err(_) => println!("{}", value),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
