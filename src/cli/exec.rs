//! Exec command implementation: run a script file through the sandbox.

use crate::cli::GlobalArgs;
use crate::plugins::PluginSystem;
use crate::sandbox::Value;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the exec command
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Script file to execute
    pub file: PathBuf,

    /// Plugin identity the script runs as
    #[arg(long, default_value = "cli")]
    pub plugin: String,

    /// Capability to request (repeatable)
    #[arg(long = "capability")]
    pub capabilities: Vec<String>,

    /// Comma-separated numbers bound to `data`
    #[arg(long, value_delimiter = ',')]
    pub data: Vec<f64>,

    /// File of numbers bound to `data`, read under the `file_read` capability
    #[arg(long, conflicts_with = "data")]
    pub data_file: Option<PathBuf>,
}

fn parse_numbers(content: &str) -> Result<Vec<f64>> {
    content
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|field| !field.is_empty())
        .map(|field| field.parse::<f64>().with_context(|| format!("Not a number: '{}'", field)))
        .collect()
}

/// Run the exec command
pub async fn run(args: ExecArgs, global: &GlobalArgs) -> Result<()> {
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Failed to read script {}", args.file.display()))?;

    let config = super::load_config(global).await;
    let mut system = PluginSystem::from_config(&config).context("Failed to initialise plugin system")?;

    let data = if let Some(path) = &args.data_file {
        let sandbox = system.sandbox_mut();
        sandbox.capabilities_mut().verify(&args.plugin, &["file_read"])?;
        sandbox.authorize_resource(&args.plugin, "file_read", &path.to_string_lossy())?;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read data file {}", path.display()))?;
        Value::from(parse_numbers(&content)?)
    } else if args.data.is_empty() {
        Value::Nil
    } else {
        Value::from(args.data)
    };

    let result = system
        .sandbox_mut()
        .execute_with(&code, &args.plugin, &args.capabilities, data, None)
        .with_context(|| format!("Execution of {} failed", args.file.display()))?;

    tracing::debug!("Resource usage: {:?}", result.usage);
    if !result.output.is_empty() {
        print!("{}", result.output);
    }
    println!("{}", result.value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn global_in(dir: &TempDir) -> GlobalArgs {
        GlobalArgs {
            config: dir.path().join("plugins.yml"),
            verbose: false,
            plugin_dirs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_exec_runs_allowed_script() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("spread.script");
        tokio::fs::write(&script, "max(data) - min(data)").await.unwrap();

        let args = ExecArgs {
            file: script,
            plugin: "cli".into(),
            capabilities: Vec::new(),
            data: vec![3.0, 9.0, 4.0],
            data_file: None,
        };
        run(args, &global_in(&temp_dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_surfaces_violation() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("evil.script");
        tokio::fs::write(&script, "system(\"rm -rf /\")").await.unwrap();

        let args = ExecArgs {
            file: script,
            plugin: "cli".into(),
            capabilities: Vec::new(),
            data: Vec::new(),
            data_file: None,
        };
        let err = run(args, &global_in(&temp_dir)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("system"));
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_numbers("1, 2.5\n3\n").unwrap(), vec![1.0, 2.5, 3.0]);
        assert!(parse_numbers("1,two").is_err());
    }

    #[tokio::test]
    async fn test_exec_data_file_needs_file_read() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("total.script");
        tokio::fs::write(&script, "sum(data)").await.unwrap();
        let data_file = temp_dir.path().join("values.csv");
        tokio::fs::write(&data_file, "1,2,3").await.unwrap();

        let args = |data_file: PathBuf| ExecArgs {
            file: script.clone(),
            plugin: "cli".into(),
            capabilities: Vec::new(),
            data: Vec::new(),
            data_file: Some(data_file),
        };

        // not approved
        assert!(run(args(data_file.clone()), &global_in(&temp_dir)).await.is_err());

        // approved, but outside the readable directories
        tokio::fs::write(temp_dir.path().join("plugins.yml"), "security:\n  allow_file_read: true\n")
            .await
            .unwrap();
        let err = run(args(data_file), &global_in(&temp_dir)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("may not access"), "{:#}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_reads_data_file_in_sandbox_directory() {
        std::fs::create_dir_all("/tmp/plugin_sandbox").unwrap();
        let data_dir = tempfile::Builder::new().tempdir_in("/tmp/plugin_sandbox").unwrap();
        let data_file = data_dir.path().join("values.csv");
        tokio::fs::write(&data_file, "1\n2\n3\n").await.unwrap();

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("total.script");
        tokio::fs::write(&script, "sum(data)").await.unwrap();
        tokio::fs::write(temp_dir.path().join("plugins.yml"), "security:\n  allow_file_read: true\n")
            .await
            .unwrap();

        let args = ExecArgs {
            file: script,
            plugin: "cli".into(),
            capabilities: Vec::new(),
            data: Vec::new(),
            data_file: Some(data_file),
        };
        run(args, &global_in(&temp_dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let args = ExecArgs {
            file: temp_dir.path().join("nope.script"),
            plugin: "cli".into(),
            capabilities: Vec::new(),
            data: Vec::new(),
            data_file: None,
        };
        assert!(run(args, &global_in(&temp_dir)).await.is_err());
    }
}
