//! Status command implementation.

use crate::cli::GlobalArgs;
use anyhow::{Context, Result};
use clap::Args;

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the status command
pub async fn run(args: StatusArgs, global: &GlobalArgs) -> Result<()> {
    let (_, system) = super::load_host(global).await?;
    let report = system.health_report();

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize health report")?;
        println!("{}", json);
    } else {
        print!("{}", report);
    }

    Ok(())
}
