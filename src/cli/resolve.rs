//! Resolve command implementation.

use crate::cli::GlobalArgs;
use crate::plugins::{CommandConflict, ConflictResolution, ConflictStrategy};
use anyhow::{anyhow, bail, Result};
use clap::Args;
use std::io::{self, BufRead, Write};

const USAGE: &str =
    "Usage: plugin-sandbox resolve <plugin> [--strategy=interactive|namespace|priority|disable] [--force]";

/// Arguments for the resolve command
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Plugin whose command conflicts to settle
    pub plugin: Option<String>,

    /// Resolution strategy (interactive, namespace, priority, disable)
    #[arg(long, default_value = "interactive")]
    pub strategy: String,

    /// Do not prompt; interactive resolution falls back to priority
    #[arg(long)]
    pub force: bool,
}

/// Run the resolve command
pub async fn run(args: ResolveArgs, global: &GlobalArgs) -> Result<()> {
    let Some(plugin) = args.plugin else {
        bail!("Plugin name required\n{}", USAGE);
    };
    let strategy: ConflictStrategy = args.strategy.parse().map_err(|e: String| anyhow!(e))?;

    let (_, mut system) = super::load_host(global).await?;
    if !system.registry().contains(&plugin) {
        bail!(
            "Plugin '{}' not found\nAvailable plugins: {}",
            plugin,
            super::known_plugins(&system).join(", ")
        );
    }

    let conflicts = system.commands().conflicts_for(&plugin);
    if conflicts.is_empty() {
        println!("Plugin '{}' has no conflicts", plugin);
        return Ok(());
    }

    let strategy = match strategy {
        ConflictStrategy::Interactive if !args.force => {
            print_conflicts(&plugin, &conflicts);
            let stdin = io::stdin();
            choose_strategy(&mut stdin.lock())?
        }
        other => other,
    };

    let resolution = system.resolve_conflicts(&plugin, strategy)?;
    print_resolution(&plugin, &resolution);
    Ok(())
}

fn print_conflicts(plugin: &str, conflicts: &[CommandConflict]) {
    println!("Plugin '{}' has {} conflict(s):", plugin, conflicts.len());
    for conflict in conflicts {
        println!(
            "  '{}' claimed by: {} (active: {})",
            conflict.command,
            conflict.claimants.join(", "),
            conflict.owner
        );
    }
    println!();
    println!("How should they be resolved?");
    println!("  1) namespace - keep both under qualified names");
    println!("  2) priority  - keep the highest-priority plugin");
    println!("  3) disable   - disable lower-priority plugins");
}

/// Read a strategy choice (number or name) from `input`
fn choose_strategy(input: &mut impl BufRead) -> Result<ConflictStrategy> {
    print!("Choice [1-3]: ");
    io::stdout().flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    match line.trim() {
        "1" | "namespace" => Ok(ConflictStrategy::Namespace),
        "2" | "priority" => Ok(ConflictStrategy::Priority),
        "3" | "disable" => Ok(ConflictStrategy::Disable),
        other => bail!("Invalid choice '{}'", other),
    }
}

fn print_resolution(plugin: &str, resolution: &ConflictResolution) {
    match resolution {
        ConflictResolution::NoConflicts => println!("Plugin '{}' has no conflicts", plugin),
        ConflictResolution::Namespaced { commands } => {
            println!("Namespaced commands of '{}':", plugin);
            for command in commands {
                println!("  {}", command);
            }
        }
        ConflictResolution::Prioritized { winners } => {
            println!("Resolved by priority:");
            for (command, winner) in winners {
                println!("  '{}' -> {}", command, winner);
            }
        }
        ConflictResolution::Disabled { plugins } if plugins.is_empty() => {
            println!("'{}' already has the highest priority; nothing disabled", plugin);
        }
        ConflictResolution::Disabled { plugins } => {
            println!("Disabled plugins: {}", plugins.join(", "));
        }
    }
}
