//! Allow/deny classification of every operation a sandboxed script performs.

use super::dispatch;
use super::value::Value;
use crate::error::SandboxError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Group of allowed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodCategory {
    Arithmetic,
    Containers,
    Text,
    Maps,
    Statistics,
    Introspection,
    Iteration,
    Output,
}

impl fmt::Display for MethodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodCategory::Arithmetic => "arithmetic",
            MethodCategory::Containers => "containers",
            MethodCategory::Text => "text",
            MethodCategory::Maps => "maps",
            MethodCategory::Statistics => "statistics",
            MethodCategory::Introspection => "introspection",
            MethodCategory::Iteration => "iteration",
            MethodCategory::Output => "output",
        };
        write!(f, "{name}")
    }
}

/// Which allowed categories a gate enables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    /// Every category plus basic output primitives
    Maximal,
    #[default]
    Standard,
    /// Arithmetic, containers and statistics only
    Minimal,
}

impl Posture {
    pub fn categories(self) -> &'static [MethodCategory] {
        use MethodCategory::*;
        match self {
            Posture::Maximal => &[
                Arithmetic,
                Containers,
                Text,
                Maps,
                Statistics,
                Introspection,
                Iteration,
                Output,
            ],
            Posture::Standard => &[
                Arithmetic,
                Containers,
                Text,
                Maps,
                Statistics,
                Introspection,
                Iteration,
            ],
            Posture::Minimal => &[Arithmetic, Containers, Statistics],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Forbidden,
    Unknown,
}

/// Why a forbidden operation is unsafe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForbiddenKind {
    CodeEvaluation,
    CommandExecution,
    Filesystem,
    Network,
    DynamicDispatch,
    ProcessControl,
    RawOutput,
    CodeLoading,
    GlobalMutation,
}

impl ForbiddenKind {
    fn message(self, method: &str) -> String {
        match self {
            ForbiddenKind::CodeEvaluation => {
                format!("Code evaluation method '{method}' is prohibited in sandbox")
            }
            ForbiddenKind::CommandExecution => {
                format!("System command execution '{method}' is not allowed")
            }
            ForbiddenKind::Filesystem => format!("File system access '{method}' is prohibited"),
            ForbiddenKind::Network => format!("Network access '{method}' is prohibited"),
            ForbiddenKind::DynamicDispatch => {
                format!("Dynamic method calling '{method}' is not permitted")
            }
            ForbiddenKind::ProcessControl => {
                format!("Thread/process control '{method}' is restricted")
            }
            ForbiddenKind::RawOutput => {
                format!("Direct output method '{method}' is restricted, return values instead")
            }
            ForbiddenKind::CodeLoading => format!("Dynamic code loading '{method}' is restricted"),
            ForbiddenKind::GlobalMutation => {
                format!("Method '{method}' is explicitly forbidden in sandbox")
            }
        }
    }
}

static ALLOWED_METHODS: Lazy<BTreeMap<MethodCategory, &'static [&'static str]>> = Lazy::new(|| {
    use MethodCategory::*;
    BTreeMap::from([
        (
            Arithmetic,
            &[
                "+", "-", "*", "/", "%", "**", "neg", "abs", "sqrt", "exp", "log", "log10",
                "log2", "sin", "cos", "tan", "floor", "ceil", "round", "min", "max", "pow",
            ][..],
        ),
        (
            Containers,
            &[
                "len", "size", "count", "first", "last", "get", "slice", "push", "concat",
                "reverse", "sort", "uniq", "flatten", "compact", "sum", "contains", "index_of",
                "is_empty",
            ][..],
        ),
        (
            Text,
            &[
                "upcase", "downcase", "trim", "split", "join", "replace", "starts_with",
                "ends_with", "chars",
            ][..],
        ),
        (
            Maps,
            &["keys", "values", "entries", "fetch", "has_key", "put", "merge"][..],
        ),
        (
            Statistics,
            &[
                "mean", "median", "mode", "variance", "std_dev", "percentile", "quartiles",
                "outliers", "correlation",
            ][..],
        ),
        (
            Introspection,
            &[
                "kind", "to_s", "inspect", "to_number", "is_nil", "is_number", "is_text",
                "is_list", "is_map",
            ][..],
        ),
        (
            Iteration,
            &["range", "zip", "enumerate", "take", "drop", "each_slice", "cumulative_sum"][..],
        ),
        (Output, &["print", "puts", "warn"][..]),
    ])
});

static FORBIDDEN_METHODS: Lazy<HashMap<&'static str, ForbiddenKind>> = Lazy::new(|| {
    use ForbiddenKind::*;
    let groups: [(ForbiddenKind, &[&str]); 9] = [
        (CodeEvaluation, &["eval", "instance_eval", "class_eval", "module_eval", "binding"]),
        (CommandExecution, &["exec", "system", "spawn", "shell", "popen", "syscall"]),
        (
            Filesystem,
            &["open", "read_file", "write_file", "delete", "rename", "mkdir", "rmdir", "chmod"],
        ),
        (Network, &["socket", "connect", "http_get", "http_post", "download"]),
        (DynamicDispatch, &["send", "invoke", "public_send", "call_method", "define_method"]),
        (ProcessControl, &["thread", "fork", "exit", "abort", "kill", "sleep", "trap", "process"]),
        (RawOutput, &["print", "puts", "warn", "printf", "putc", "write"]),
        (CodeLoading, &["load", "require", "import", "autoload"]),
        (GlobalMutation, &["set_env", "setenv", "set_global", "const_set", "at_exit"]),
    ];
    groups
        .into_iter()
        .flat_map(|(kind, methods)| methods.iter().map(move |m| (*m, kind)))
        .collect()
});

/// Classifies and performs operations under a posture, counting violations
#[derive(Debug)]
pub struct MethodGate {
    posture: Posture,
    allowed: HashSet<&'static str>,
    violations: AtomicUsize,
}

impl Default for MethodGate {
    fn default() -> Self {
        Self::new(Posture::default())
    }
}

impl MethodGate {
    pub fn new(posture: Posture) -> Self {
        let allowed = posture
            .categories()
            .iter()
            .filter_map(|category| ALLOWED_METHODS.get(category))
            .flat_map(|methods| methods.iter().copied())
            .collect();
        Self {
            posture,
            allowed,
            violations: AtomicUsize::new(0),
        }
    }

    pub fn posture(&self) -> Posture {
        self.posture
    }

    /// Allowed operations of one category, regardless of posture
    pub fn category_methods(category: MethodCategory) -> &'static [&'static str] {
        ALLOWED_METHODS.get(&category).copied().unwrap_or_default()
    }

    /// Every operation on the deny-list
    pub fn forbidden_methods() -> Vec<&'static str> {
        let mut methods: Vec<_> = FORBIDDEN_METHODS.keys().copied().collect();
        methods.sort_unstable();
        methods
    }

    /// Deny-list entry for `method`, whatever the posture
    pub fn forbidden_kind(method: &str) -> Option<ForbiddenKind> {
        FORBIDDEN_METHODS.get(method).copied()
    }

    /// The allow-list is consulted first, so a posture may re-enable a
    /// deny-listed name (the maximal posture's output primitives).
    pub fn check(&self, method: &str) -> Classification {
        if self.allowed.contains(method) {
            Classification::Allowed
        } else if FORBIDDEN_METHODS.contains_key(method) {
            Classification::Forbidden
        } else {
            Classification::Unknown
        }
    }

    /// Raise a security error unless `method` is allowed
    pub fn guard(&self, method: &str) -> Result<(), SandboxError> {
        match self.check(method) {
            Classification::Allowed => Ok(()),
            Classification::Forbidden => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                let message = FORBIDDEN_METHODS
                    .get(method)
                    .map(|kind| kind.message(method))
                    .unwrap_or_else(|| format!("Method '{method}' is explicitly forbidden in sandbox"));
                Err(SandboxError::Security(message))
            }
            Classification::Unknown => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                let categories = self
                    .posture
                    .categories()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(SandboxError::Security(format!(
                    "Method '{method}' is not in the whitelist. Allowed categories: {categories}"
                )))
            }
        }
    }

    /// Check `method` and, if allowed, perform it on `args`
    pub fn intercept(
        &self,
        method: &str,
        args: Vec<Value>,
        output: &mut String,
    ) -> Result<Value, SandboxError> {
        self.guard(method)?;
        dispatch::perform(method, args, output)
    }

    pub fn violation_count(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("eval", "prohibited")]
    #[case("instance_eval", "prohibited")]
    #[case("system", "not allowed")]
    #[case("exec", "not allowed")]
    #[case("spawn", "not allowed")]
    #[case("open", "prohibited")]
    #[case("socket", "prohibited")]
    #[case("send", "not permitted")]
    #[case("invoke", "not permitted")]
    #[case("fork", "restricted")]
    #[case("exit", "restricted")]
    #[case("puts", "restricted")]
    #[case("require", "restricted")]
    #[case("set_env", "explicitly forbidden")]
    fn test_forbidden_message_names_category(#[case] method: &str, #[case] term: &str) {
        let gate = MethodGate::new(Posture::Standard);
        let err = gate
            .intercept(method, vec![Value::from("x")], &mut String::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
        assert!(err.to_string().contains(term), "{err}");
        assert!(err.to_string().contains(method));
        assert_eq!(gate.violation_count(), 1);
    }

    #[rstest]
    #[case(Posture::Maximal)]
    #[case(Posture::Standard)]
    #[case(Posture::Minimal)]
    fn test_allowed_methods_never_raise_security_errors(#[case] posture: Posture) {
        let gate = MethodGate::new(posture);
        for category in posture.categories() {
            for method in MethodGate::category_methods(*category) {
                assert_eq!(gate.check(method), Classification::Allowed, "{method}");
                assert!(gate.guard(method).is_ok());
            }
        }
        assert_eq!(gate.violation_count(), 0);
    }

    #[test]
    fn test_unknown_method_lists_active_categories() {
        let gate = MethodGate::new(Posture::Minimal);
        let err = gate.guard("frobnicate").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Method 'frobnicate' is not in the whitelist. Allowed categories: arithmetic, containers, statistics"
        );
    }

    #[test]
    fn test_minimal_posture_rejects_text_methods() {
        let gate = MethodGate::new(Posture::Minimal);
        assert_eq!(gate.check("upcase"), Classification::Unknown);
        assert_eq!(gate.check("mean"), Classification::Allowed);
    }

    #[test]
    fn test_maximal_posture_allows_output() {
        let gate = MethodGate::new(Posture::Maximal);
        let mut out = String::new();
        gate.intercept("puts", vec![Value::from("hello")], &mut out)
            .unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(MethodGate::new(Posture::Standard).check("puts"), Classification::Forbidden);
    }

    #[test]
    fn test_allowed_method_is_performed() {
        let gate = MethodGate::default();
        let result = gate
            .intercept("mean", vec![Value::from(vec![1.0, 2.0, 3.0])], &mut String::new())
            .unwrap();
        assert_eq!(result, Value::Number(2.0));
    }

    #[test]
    fn test_allow_and_deny_lists_only_overlap_on_output() {
        let overlap: Vec<_> = ALLOWED_METHODS
            .iter()
            .filter(|(category, _)| **category != MethodCategory::Output)
            .flat_map(|(_, methods)| methods.iter())
            .filter(|m| FORBIDDEN_METHODS.contains_key(*m))
            .collect();
        assert!(overlap.is_empty(), "{overlap:?}");
    }
}
