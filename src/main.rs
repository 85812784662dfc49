//! plugin-sandbox - sandboxed, dependency-aware plugin host
//!
//! Main binary entry point for the command-line interface.

use clap::{CommandFactory, Parser};
use plugin_sandbox::cli::{self, Cli, Commands};
use plugin_sandbox::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.global.verbose) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let global = cli.global;
    let result = match cli.command {
        Some(Commands::List(args)) => cli::list::run(args, &global).await,
        Some(Commands::Conflicts) => cli::conflicts::run(&global).await,
        Some(Commands::Resolve(args)) => cli::resolve::run(args, &global).await,
        Some(Commands::Status(args)) => cli::status::run(args, &global).await,
        Some(Commands::Exec(args)) => cli::exec::run(args, &global).await,
        None if cli.conflicts => cli::conflicts::run(&global).await,
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
