//! Implementations behind allowed gate operations.
//!
//! Lookup runs through three tiers: the numeric library, the first
//! argument's own behaviour, then the global fallback. `None` from a tier
//! means "not handled here".

use super::stats;
use super::value::Value;
use crate::error::SandboxError;
use std::collections::BTreeMap;

type Outcome = Option<Result<Value, SandboxError>>;

/// Largest list or text a single operation may produce
const MAX_GENERATED: usize = 1_000_000;

pub(crate) fn perform(name: &str, args: Vec<Value>, output: &mut String) -> Result<Value, SandboxError> {
    if let Some(result) = numeric(name, &args) {
        return result;
    }
    if let Some(result) = receiver(name, &args) {
        return result;
    }
    if let Some(result) = global(name, &args, output) {
        return result;
    }
    Err(SandboxError::runtime(format!(
        "Method '{name}' is not available in sandbox context for ({})",
        args.iter().map(Value::kind).collect::<Vec<_>>().join(", ")
    )))
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), SandboxError> {
    if args.len() != expected {
        return Err(SandboxError::runtime(format!(
            "wrong number of arguments for '{name}' (given {}, expected {expected})",
            args.len()
        )));
    }
    Ok(())
}

fn domain(name: &str) -> SandboxError {
    SandboxError::runtime(format!("Numerical argument is out of domain - {name}"))
}

fn number_list(name: &str, value: &Value) -> Result<Vec<f64>, SandboxError> {
    value
        .numbers()
        .ok_or_else(|| SandboxError::runtime(format!("'{name}' requires a list of numbers")))
}

fn optional(value: Option<f64>) -> Value {
    value.map(Value::Number).unwrap_or(Value::Nil)
}

fn index(len: usize, i: f64) -> Option<usize> {
    let i = i as i64;
    let resolved = if i < 0 { len as i64 + i } else { i };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

/// Tier one: arithmetic on plain numbers and statistics over number lists
fn numeric(name: &str, args: &[Value]) -> Outcome {
    let nums: Option<Vec<f64>> = args.iter().map(Value::as_number).collect();

    if let Some(nums) = nums.filter(|n| !n.is_empty()) {
        let result = match (name, nums.as_slice()) {
            ("+", [a, b]) => Ok(a + b),
            ("-", [a, b]) => Ok(a - b),
            ("*", [a, b]) => Ok(a * b),
            ("/", [_, b]) | ("%", [_, b]) if *b == 0.0 => {
                Err(SandboxError::runtime("divided by 0"))
            }
            ("/", [a, b]) => Ok(a / b),
            ("%", [a, b]) => Ok(a.rem_euclid(*b)),
            ("**", [a, b]) | ("pow", [a, b]) => Ok(a.powf(*b)),
            ("neg", [a]) => Ok(-a),
            ("abs", [a]) => Ok(a.abs()),
            ("sqrt", [a]) if *a < 0.0 => Err(domain("sqrt")),
            ("sqrt", [a]) => Ok(a.sqrt()),
            ("exp", [a]) => Ok(a.exp()),
            ("log" | "log10" | "log2", [a]) if *a <= 0.0 => Err(domain(name)),
            ("log", [a]) => Ok(a.ln()),
            ("log10", [a]) => Ok(a.log10()),
            ("log2", [a]) => Ok(a.log2()),
            ("sin", [a]) => Ok(a.sin()),
            ("cos", [a]) => Ok(a.cos()),
            ("tan", [a]) => Ok(a.tan()),
            ("floor", [a]) => Ok(a.floor()),
            ("ceil", [a]) => Ok(a.ceil()),
            ("round", [a]) => Ok(a.round()),
            ("round", [a, digits]) => {
                let factor = 10f64.powi(*digits as i32);
                Ok((a * factor).round() / factor)
            }
            ("min", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |m, v| m.min(*v))),
            ("max", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |m, v| m.max(*v))),
            _ => return None,
        };
        return Some(result.map(Value::Number));
    }

    let first = args.first()?;
    let values = first.numbers()?;
    let result = match (name, args.len()) {
        ("mean", 1) => Ok(optional(stats::mean(&values))),
        ("median", 1) => Ok(optional(stats::median(&values))),
        ("mode", 1) => Ok(Value::from(stats::mode(&values))),
        ("variance", 1) => Ok(optional(stats::variance(&values))),
        ("std_dev", 1) => Ok(optional(stats::standard_deviation(&values))),
        ("percentile", 2) => match args[1].as_number() {
            Some(p) => Ok(optional(stats::percentile(&values, p))),
            None => Err(SandboxError::runtime("'percentile' requires a numeric rank")),
        },
        ("quartiles", 1) => Ok(match stats::quartiles(&values) {
            Some((q1, q2, q3)) => Value::Map(BTreeMap::from([
                ("q1".to_string(), Value::Number(q1)),
                ("q2".to_string(), Value::Number(q2)),
                ("q3".to_string(), Value::Number(q3)),
            ])),
            None => Value::Nil,
        }),
        ("outliers", 1) => Ok(Value::from(stats::outliers(&values))),
        ("correlation", 2) => {
            number_list(name, &args[1]).map(|ys| optional(stats::correlation(&values, &ys)))
        }
        ("sum", 1) => Ok(Value::Number(values.iter().sum())),
        ("min", 1) => Ok(optional(values.iter().copied().reduce(f64::min))),
        ("max", 1) => Ok(optional(values.iter().copied().reduce(f64::max))),
        ("cumulative_sum", 1) => Ok(Value::from(
            values
                .iter()
                .scan(0.0, |acc, v| {
                    *acc += v;
                    Some(*acc)
                })
                .collect::<Vec<_>>(),
        )),
        _ => return None,
    };
    Some(result)
}

/// Tier two: behaviour owned by the first argument
fn receiver(name: &str, args: &[Value]) -> Outcome {
    match args.first()? {
        Value::List(items) => list_method(name, items, &args[1..]),
        Value::Text(text) => text_method(name, text, &args[1..]),
        Value::Map(map) => map_method(name, map, &args[1..]),
        _ => None,
    }
}

fn list_method(name: &str, items: &[Value], rest: &[Value]) -> Outcome {
    let result = match (name, rest) {
        ("len" | "size" | "count", []) => Ok(Value::Number(items.len() as f64)),
        ("is_empty", []) => Ok(Value::Bool(items.is_empty())),
        ("first", []) => Ok(items.first().cloned().unwrap_or_default()),
        ("last", []) => Ok(items.last().cloned().unwrap_or_default()),
        ("get", [Value::Number(i)]) => {
            Ok(index(items.len(), *i).map(|i| items[i].clone()).unwrap_or_default())
        }
        ("slice", [Value::Number(start), Value::Number(len)]) => {
            let start = (*start as usize).min(items.len());
            let end = start.saturating_add(*len as usize).min(items.len());
            Ok(Value::List(items[start..end].to_vec()))
        }
        ("take", [Value::Number(n)]) => {
            Ok(Value::List(items.iter().take(*n as usize).cloned().collect()))
        }
        ("drop", [Value::Number(n)]) => {
            Ok(Value::List(items.iter().skip(*n as usize).cloned().collect()))
        }
        ("push", [value]) => {
            let mut out = items.to_vec();
            out.push(value.clone());
            Ok(Value::List(out))
        }
        ("+" | "concat", [Value::List(other)]) => {
            Ok(Value::List(items.iter().chain(other).cloned().collect()))
        }
        ("reverse", []) => Ok(Value::List(items.iter().rev().cloned().collect())),
        ("sort", []) => sort(items),
        ("uniq", []) => {
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Ok(Value::List(out))
        }
        ("flatten", []) => {
            let mut out = Vec::new();
            flatten_into(items, &mut out);
            Ok(Value::List(out))
        }
        ("compact", []) => Ok(Value::List(
            items.iter().filter(|v| **v != Value::Nil).cloned().collect(),
        )),
        ("contains", [value]) => Ok(Value::Bool(items.contains(value))),
        ("index_of", [value]) => Ok(optional(
            items.iter().position(|v| v == value).map(|i| i as f64),
        )),
        ("join", [Value::Text(sep)]) => Ok(Value::Text(
            items.iter().map(ToString::to_string).collect::<Vec<_>>().join(sep.as_str()),
        )),
        ("join", []) => Ok(Value::Text(items.iter().map(ToString::to_string).collect())),
        ("zip", [Value::List(other)]) => Ok(Value::List(
            items
                .iter()
                .zip(other)
                .map(|(a, b)| Value::List(vec![a.clone(), b.clone()]))
                .collect(),
        )),
        ("enumerate", []) => Ok(Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| Value::List(vec![Value::Number(i as f64), v.clone()]))
                .collect(),
        )),
        ("each_slice", [Value::Number(n)]) if *n >= 1.0 => Ok(Value::List(
            items
                .chunks(*n as usize)
                .map(|chunk| Value::List(chunk.to_vec()))
                .collect(),
        )),
        ("each_slice", [_]) => Err(SandboxError::runtime("invalid slice size")),
        _ => return None,
    };
    Some(result)
}

fn sort(items: &[Value]) -> Result<Value, SandboxError> {
    if let Some(mut nums) = Value::List(items.to_vec()).numbers() {
        nums.sort_by(f64::total_cmp);
        return Ok(Value::from(nums));
    }
    let texts: Option<Vec<&str>> = items.iter().map(Value::as_text).collect();
    match texts {
        Some(mut texts) => {
            texts.sort_unstable();
            Ok(Value::List(texts.into_iter().map(Value::from).collect()))
        }
        None => Err(SandboxError::runtime("comparison of mixed values failed")),
    }
}

fn flatten_into(items: &[Value], out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::List(inner) => flatten_into(inner, out),
            other => out.push(other.clone()),
        }
    }
}

fn text_method(name: &str, text: &str, rest: &[Value]) -> Outcome {
    let result = match (name, rest) {
        ("len" | "size", []) => Ok(Value::Number(text.chars().count() as f64)),
        ("is_empty", []) => Ok(Value::Bool(text.is_empty())),
        ("upcase", []) => Ok(Value::from(text.to_uppercase())),
        ("downcase", []) => Ok(Value::from(text.to_lowercase())),
        ("trim", []) => Ok(Value::from(text.trim())),
        ("reverse", []) => Ok(Value::from(text.chars().rev().collect::<String>())),
        ("chars", []) => Ok(Value::List(
            text.chars().map(|c| Value::from(c.to_string())).collect(),
        )),
        ("split", []) => Ok(Value::List(text.split_whitespace().map(Value::from).collect())),
        ("split", [Value::Text(sep)]) => {
            Ok(Value::List(text.split(sep.as_str()).map(Value::from).collect()))
        }
        ("replace", [Value::Text(from), Value::Text(to)]) => {
            Ok(Value::from(text.replace(from.as_str(), to)))
        }
        ("contains", [Value::Text(needle)]) => Ok(Value::Bool(text.contains(needle.as_str()))),
        ("starts_with", [Value::Text(prefix)]) => {
            Ok(Value::Bool(text.starts_with(prefix.as_str())))
        }
        ("ends_with", [Value::Text(suffix)]) => Ok(Value::Bool(text.ends_with(suffix.as_str()))),
        ("+" | "concat", [other]) => Ok(Value::from(format!("{text}{other}"))),
        ("*", [Value::Number(n)]) if *n >= 0.0 => {
            if (text.len() as f64) * n > MAX_GENERATED as f64 {
                Err(too_large("*"))
            } else {
                Ok(Value::from(text.repeat(*n as usize)))
            }
        }
        ("slice", [Value::Number(start), Value::Number(len)]) => Ok(Value::from(
            text.chars()
                .skip(*start as usize)
                .take(*len as usize)
                .collect::<String>(),
        )),
        ("to_number", []) => Ok(text
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or_default()),
        _ => return None,
    };
    Some(result)
}

fn map_method(name: &str, map: &BTreeMap<String, Value>, rest: &[Value]) -> Outcome {
    let result = match (name, rest) {
        ("len" | "size", []) => Ok(Value::Number(map.len() as f64)),
        ("is_empty", []) => Ok(Value::Bool(map.is_empty())),
        ("keys", []) => Ok(Value::List(map.keys().map(|k| Value::from(k.as_str())).collect())),
        ("values", []) => Ok(Value::List(map.values().cloned().collect())),
        ("entries", []) => Ok(Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![Value::from(k.as_str()), v.clone()]))
                .collect(),
        )),
        ("get" | "fetch", [Value::Text(key)]) => Ok(map.get(key).cloned().unwrap_or_default()),
        ("fetch", [Value::Text(key), default]) => {
            Ok(map.get(key).cloned().unwrap_or_else(|| default.clone()))
        }
        ("has_key", [Value::Text(key)]) => Ok(Value::Bool(map.contains_key(key))),
        ("put", [Value::Text(key), value]) => {
            let mut out = map.clone();
            out.insert(key.clone(), value.clone());
            Ok(Value::Map(out))
        }
        ("merge", [Value::Map(other)]) => {
            let mut out = map.clone();
            out.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(Value::Map(out))
        }
        _ => return None,
    };
    Some(result)
}

/// Tier three: process-global functions; output lands in the captured buffer
fn global(name: &str, args: &[Value], output: &mut String) -> Outcome {
    let result = match name {
        "print" | "puts" | "warn" => {
            let line = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
            output.push_str(&line);
            if name != "print" {
                output.push('\n');
            }
            Ok(Value::Nil)
        }
        "to_s" => arity(name, args, 1).map(|_| Value::from(args[0].to_string())),
        "inspect" => arity(name, args, 1)
            .map(|_| Value::from(serde_json::to_string(&args[0]).unwrap_or_default())),
        "kind" => arity(name, args, 1).map(|_| Value::from(args[0].kind())),
        "is_nil" | "is_number" | "is_text" | "is_list" | "is_map" => {
            arity(name, args, 1).map(|_| {
                let kind = args[0].kind();
                Value::Bool(name.strip_prefix("is_") == Some(kind))
            })
        }
        "to_number" => arity(name, args, 1).map(|_| match &args[0] {
            Value::Number(n) => Value::Number(*n),
            Value::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
            _ => Value::Nil,
        }),
        "range" => match args {
            [Value::Number(end)] => range(0.0, *end),
            [Value::Number(start), Value::Number(end)] => range(*start, *end),
            _ => Err(SandboxError::runtime("'range' requires numeric bounds")),
        },
        _ => return None,
    };
    Some(result)
}

fn range(start: f64, end: f64) -> Result<Value, SandboxError> {
    let (start, end) = (start as i64, end as i64);
    if end.saturating_sub(start) > MAX_GENERATED as i64 {
        return Err(too_large("range"));
    }
    Ok(Value::List((start..end).map(|i| Value::Number(i as f64)).collect()))
}

fn too_large(name: &str) -> SandboxError {
    SandboxError::Resource(format!(
        "'{name}' would generate more than {MAX_GENERATED} elements"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        perform(name, args, &mut String::new())
    }

    #[test]
    fn test_numeric_tier_handles_operators() {
        assert_eq!(call("+", vec![2.0.into(), 3.0.into()]).unwrap(), Value::Number(5.0));
        assert_eq!(call("**", vec![2.0.into(), 10.0.into()]).unwrap(), Value::Number(1024.0));
        assert_eq!(call("round", vec![1.23456.into(), 2.0.into()]).unwrap(), Value::Number(1.23));
        assert!(call("/", vec![1.0.into(), 0.0.into()]).is_err());
    }

    #[test]
    fn test_statistics_over_lists() {
        let data = Value::from(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(call("mean", vec![data.clone()]).unwrap(), Value::Number(2.5));
        assert_eq!(call("sum", vec![data.clone()]).unwrap(), Value::Number(10.0));
        assert_eq!(call("max", vec![data]).unwrap(), Value::Number(4.0));
    }

    #[test]
    fn test_receiver_tier_dispatches_on_first_argument() {
        let list = Value::from(vec![3.0, 1.0, 2.0]);
        assert_eq!(call("sort", vec![list.clone()]).unwrap(), Value::from(vec![1.0, 2.0, 3.0]));
        assert_eq!(call("len", vec![Value::from("héllo")]).unwrap(), Value::Number(5.0));
        assert_eq!(
            call("+", vec![Value::from("a"), Value::from("b")]).unwrap(),
            Value::from("ab")
        );
        assert_eq!(call("get", vec![list, (-1.0).into()]).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_global_output_is_captured() {
        let mut out = String::new();
        perform("puts", vec![Value::from("hi"), 2.0.into()], &mut out).unwrap();
        assert_eq!(out, "hi 2\n");
    }

    #[test]
    fn test_unimplemented_combination_is_runtime_error() {
        let err = call("upcase", vec![1.0.into()]).unwrap_err();
        assert!(err.to_string().contains("not available in sandbox context"));
    }
}
