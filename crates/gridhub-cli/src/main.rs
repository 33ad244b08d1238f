//! Gridhub CLI: the `gridhub` command.

mod cli;
mod commands;
mod observability;
mod support;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    observability::init_logging(cli.global.log_format);

    match cli.command {
        Commands::Project { command } => commands::project::run(&cli.global, command),
        Commands::Lock { command } => commands::lock::run(&cli.global, command),
        Commands::Net { command } => commands::net::run(&cli.global, command),
        Commands::Variant { command } => commands::variant::run(&cli.global, command),
        Commands::Element { command } => commands::element::run(&cli.global, command),
        Commands::Ts { command } => commands::ts::run(&cli.global, command),
    }
}
