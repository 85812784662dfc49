//! Conflicts command implementation.

use crate::cli::GlobalArgs;
use crate::plugins::conflicts::{conflict_report, naming_report};
use anyhow::Result;

/// Run the conflicts command (also reached through `--conflicts`)
pub async fn run(global: &GlobalArgs) -> Result<()> {
    let (_, system) = super::load_host(global).await?;
    println!("{}", conflict_report(&system.conflicts()));

    let naming = system.naming_conflicts();
    if !naming.is_empty() {
        println!("{}", naming_report(&naming));
    }
    Ok(())
}
