//! List command implementation.

use crate::cli::GlobalArgs;
use crate::plugins::conflicts::conflict_report;
use crate::plugins::PluginSystem;
use anyhow::Result;
use clap::Args;

/// Arguments for the list command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Also print the command conflict report
    #[arg(long)]
    pub show_conflicts: bool,
}

/// Run the list command
pub async fn run(args: ListArgs, global: &GlobalArgs) -> Result<()> {
    let (_, system) = super::load_host(global).await?;

    print_plugins(&system);

    if args.show_conflicts {
        println!();
        println!("{}", conflict_report(&system.conflicts()));
    }

    Ok(())
}

fn print_plugins(system: &PluginSystem) {
    let registry = system.registry();
    if registry.is_empty() && registry.discovered().is_empty() {
        println!("No plugins found.");
        return;
    }

    println!("Available plugins:\n");
    for descriptor in registry.descriptors() {
        println!(
            "  {:<24} v{:<8} {:<12} priority {:<4} {}",
            descriptor.id,
            descriptor.manifest.version,
            descriptor.origin,
            system.priority().tier(&descriptor.origin),
            descriptor.state
        );
        if !descriptor.manifest.description.is_empty() {
            println!("      {}", descriptor.manifest.description);
        }
        if !descriptor.manifest.commands.is_empty() {
            let commands: Vec<&str> = descriptor.manifest.commands.keys().map(String::as_str).collect();
            println!("      commands: {}", commands.join(", "));
        }
    }

    let pending: Vec<&String> = registry
        .discovered()
        .keys()
        .filter(|name| !registry.contains(name))
        .collect();
    if !pending.is_empty() {
        println!("\nDiscovered, not registered:");
        for name in pending {
            println!("  {}", name);
        }
    }
}
