//! Core plugins shipped with the host.

use crate::error::{RegistryError, SandboxError};
use crate::plugins::descriptor::{Operation, Plugin, PluginManifest};
use crate::plugins::priority::PluginOrigin;
use crate::plugins::registry::{PluginRegistry, RegisterOptions};
use crate::sandbox::{stats, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const BASIC_STATS: &str = "core_basic_stats";
pub const DISTRIBUTION: &str = "core_distribution";

/// Plugins loaded when the configuration enables nothing
pub const CORE_PLUGINS: [&str; 2] = [BASIC_STATS, DISTRIBUTION];

fn numbers(input: &Value) -> Result<Vec<f64>, SandboxError> {
    match input.numbers() {
        Some(values) if !values.is_empty() => Ok(values),
        Some(_) => Err(SandboxError::runtime("no data points given")),
        None => Err(SandboxError::runtime(format!(
            "expected a list of numbers, got {}",
            input.kind()
        ))),
    }
}

fn required(value: Option<f64>, what: &str) -> Result<Value, SandboxError> {
    value
        .map(Value::Number)
        .ok_or_else(|| SandboxError::runtime(format!("not enough data points for {}", what)))
}

fn mean(input: &Value) -> Result<Value, SandboxError> {
    required(stats::mean(&numbers(input)?), "mean")
}

fn median(input: &Value) -> Result<Value, SandboxError> {
    required(stats::median(&numbers(input)?), "median")
}

fn mode(input: &Value) -> Result<Value, SandboxError> {
    Ok(stats::mode(&numbers(input)?).into())
}

fn variance(input: &Value) -> Result<Value, SandboxError> {
    required(stats::variance(&numbers(input)?), "variance")
}

fn standard_deviation(input: &Value) -> Result<Value, SandboxError> {
    required(stats::standard_deviation(&numbers(input)?), "standard deviation")
}

fn summary(input: &Value) -> Result<Value, SandboxError> {
    let values = numbers(input)?;
    let mut fields = BTreeMap::new();
    fields.insert("count".to_string(), Value::Number(values.len() as f64));
    fields.insert("mean".to_string(), stats::mean(&values).map_or(Value::Nil, Value::Number));
    fields.insert("median".to_string(), stats::median(&values).map_or(Value::Nil, Value::Number));
    fields.insert(
        "standard_deviation".to_string(),
        stats::standard_deviation(&values).map_or(Value::Nil, Value::Number),
    );
    fields.insert(
        "min".to_string(),
        Value::Number(values.iter().copied().fold(f64::INFINITY, f64::min)),
    );
    fields.insert(
        "max".to_string(),
        Value::Number(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
    );
    Ok(Value::Map(fields))
}

fn quartiles(input: &Value) -> Result<Value, SandboxError> {
    let (q1, q2, q3) = stats::quartiles(&numbers(input)?)
        .ok_or_else(|| SandboxError::runtime("not enough data points for quartiles"))?;
    Ok(vec![q1, q2, q3].into())
}

fn outliers(input: &Value) -> Result<Value, SandboxError> {
    Ok(stats::outliers(&numbers(input)?).into())
}

/// Descriptive statistics: mean, median, mode, spread
pub struct BasicStatsPlugin {
    manifest: PluginManifest,
}

impl Default for BasicStatsPlugin {
    fn default() -> Self {
        let mut manifest = PluginManifest::new(BASIC_STATS, "1.0.0")
            .with_origin(PluginOrigin::Core)
            .with_command("mean", "mean")
            .with_command("summary", "summary");
        manifest.description = "Descriptive statistics".to_string();
        manifest.author = "Statistics Core Team".to_string();
        manifest.category = "descriptive".to_string();
        Self { manifest }
    }
}

impl Plugin for BasicStatsPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn operations(&self) -> Vec<Operation> {
        vec![
            Operation::native("mean", mean),
            Operation::native("median", median),
            Operation::native("mode", mode),
            Operation::native("variance", variance),
            Operation::native("standard_deviation", standard_deviation),
            Operation::native("summary", summary),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Distribution shape: quartiles and outliers
pub struct DistributionPlugin {
    manifest: PluginManifest,
}

impl Default for DistributionPlugin {
    fn default() -> Self {
        let mut manifest = PluginManifest::new(DISTRIBUTION, "1.0.0")
            .with_origin(PluginOrigin::Core)
            .with_dependencies([format!("{} ~> 1.0", BASIC_STATS)])
            .with_command("quartiles", "quartiles")
            .with_command("outliers", "outliers");
        manifest.description = "Quartiles and outlier detection".to_string();
        manifest.author = "Statistics Core Team".to_string();
        manifest.category = "distribution".to_string();
        Self { manifest }
    }
}

impl Plugin for DistributionPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn operations(&self) -> Vec<Operation> {
        vec![
            Operation::native("quartiles", quartiles),
            Operation::native("outliers", outliers),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Register the core plugins; already-registered ones are left alone
pub fn register_builtins(registry: &mut PluginRegistry) -> Result<(), RegistryError> {
    registry.register(BASIC_STATS, Arc::new(BasicStatsPlugin::default()), RegisterOptions::default())?;
    registry.register(DISTRIBUTION, Arc::new(DistributionPlugin::default()), RegisterOptions::default())?;
    Ok(())
}
