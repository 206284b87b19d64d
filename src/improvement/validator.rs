use super::python::{ExecutionOutcome, PythonError, PythonRuntime, SourceReport};
use crate::models::{Direction, PricePoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Modules a candidate may import (submodules of these roots included)
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "statistics",
    "datetime",
    "typing",
    "dataclasses",
    "collections",
    "functools",
    "itertools",
    "decimal",
    "fractions",
    "logging",
    "json",
];

const FORBIDDEN_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "__import__",
    "input",
    "breakpoint",
    "globals",
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "locals",
    "__builtins__",
    "__loader__",
    "__spec__",
];

/// Escape hatches: module re-exports (`logging.os`), frames and function internals
const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__dict__",
    "__closure__",
    "__defaults__",
    "__traceback__",
    "__loader__",
    "__spec__",
    "os",
    "sys",
    "builtins",
    "importlib",
    "subprocess",
    "_exit",
    "_getframe",
    "tb_frame",
    "f_back",
    "f_globals",
    "f_locals",
    "f_builtins",
    "gi_frame",
    "cr_frame",
];

const MAX_STDERR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Syntax,
    Signature,
    ImportSafety,
    SandboxedExecution,
}

impl CheckKind {
    /// Fixed order in which checks run and are reported
    pub const ORDER: [CheckKind; 4] = [
        CheckKind::Syntax,
        CheckKind::Signature,
        CheckKind::ImportSafety,
        CheckKind::SandboxedExecution,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Syntax => "syntax",
            CheckKind::Signature => "signature",
            CheckKind::ImportSafety => "import_safety",
            CheckKind::SandboxedExecution => "sandboxed_execution",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub passed: bool,
    /// False when an earlier gate kept this check from running
    pub ran: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn passed(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            ran: true,
            detail: detail.into(),
        }
    }

    pub fn failed(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            ran: true,
            detail: detail.into(),
        }
    }

    pub fn not_run(kind: CheckKind, reason: &str) -> Self {
        Self {
            kind,
            passed: false,
            ran: false,
            detail: format!("not run: {}", reason),
        }
    }
}

/// Outcome of one validation pass. Built only from its checks, so `is_valid`
/// always agrees with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    is_valid: bool,
    checks: Vec<CheckResult>,
    error_summary: String,
}

impl ValidationResult {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let is_valid = !checks.is_empty() && checks.iter().all(|c| c.passed);
        let error_summary = checks
            .iter()
            .filter(|c| c.ran && !c.passed)
            .map(|c| format!("{}: {}", c.kind.name(), c.detail))
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            is_valid,
            checks,
            error_summary,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    /// Failing checks, one per line as `<check>: <detail>`; empty when valid
    pub fn error_summary(&self) -> &str {
        &self.error_summary
    }

    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.kind == kind)
    }
}

/// Entry point contract, written as `name(param, ...)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<String>,
}

impl FromStr for FunctionSignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("def ").unwrap_or(s).trim_end_matches(':').trim();

        let (name, rest) = s
            .split_once('(')
            .ok_or_else(|| format!("invalid signature '{}': missing '('", s))?;
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| format!("invalid signature '{}': missing ')'", s))?;

        let name = name.trim();
        let is_identifier = |t: &str| {
            !t.is_empty()
                && !t.starts_with(|c: char| c.is_ascii_digit())
                && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !is_identifier(name) {
            return Err(format!("invalid function name '{}'", name));
        }

        let mut params = Vec::new();
        for raw in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            // Annotations and defaults are not part of the contract
            let param = raw
                .split(|c: char| c == ':' || c == '=')
                .next()
                .unwrap_or("")
                .trim();
            if !is_identifier(param) {
                return Err(format!("invalid parameter '{}' in signature '{}'", raw, s));
            }
            params.push(param.to_string());
        }

        Ok(Self {
            name: name.to_string(),
            params,
        })
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

/// Seam between the engine and whatever judges a candidate
#[async_trait]
pub trait CandidateValidator: Send + Sync {
    async fn validate(&self, code: &str, expected: &FunctionSignature) -> ValidationResult;
}

/// Runs the four fixed checks against candidate predictor code
#[derive(Debug, Clone)]
pub struct CodeValidator {
    runtime: PythonRuntime,
    allowed_imports: Vec<String>,
    sample_input: Vec<PricePoint>,
}

impl CodeValidator {
    /// Fails when the interpreter cannot be used
    pub async fn new(runtime: PythonRuntime) -> Result<Self, PythonError> {
        let version = runtime.check_version().await?;
        tracing::debug!(
            interpreter = %runtime.interpreter().display(),
            version = %version,
            "Python runtime ready"
        );

        Ok(Self {
            runtime,
            allowed_imports: DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            sample_input: sample_price_data(),
        })
    }

    pub fn with_allowed_imports(mut self, allowed: Vec<String>) -> Self {
        self.allowed_imports = allowed;
        self
    }

    pub fn with_sample_input(mut self, sample: Vec<PricePoint>) -> Self {
        self.sample_input = sample;
        self
    }

    pub fn allowed_imports(&self) -> &[String] {
        &self.allowed_imports
    }

    pub fn runtime(&self) -> &PythonRuntime {
        &self.runtime
    }

    /// Every check that can run does; nothing escapes as an error
    pub async fn validate(&self, code: &str, expected: &FunctionSignature) -> ValidationResult {
        let report = match self.runtime.inspect(code, &self.allowed_imports).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Source inspection failed: {}", e);
                return ValidationResult::from_checks(vec![
                    CheckResult::failed(CheckKind::Syntax, format!("could not inspect source: {}", e)),
                    CheckResult::not_run(CheckKind::Signature, "source was not inspected"),
                    CheckResult::not_run(CheckKind::ImportSafety, "source was not inspected"),
                    CheckResult::not_run(CheckKind::SandboxedExecution, "source was not inspected"),
                ]);
            }
        };

        if let Some(error) = &report.syntax_error {
            return ValidationResult::from_checks(vec![
                CheckResult::failed(CheckKind::Syntax, error.to_string()),
                CheckResult::not_run(CheckKind::Signature, "source does not parse"),
                CheckResult::not_run(CheckKind::ImportSafety, "source does not parse"),
                CheckResult::not_run(CheckKind::SandboxedExecution, "source does not parse"),
            ]);
        }

        let mut checks = vec![
            CheckResult::passed(CheckKind::Syntax, "parsed"),
            check_signature(&report, expected),
            check_import_safety(&report, &self.allowed_imports),
        ];

        if checks.iter().all(|c| c.passed) {
            checks.push(self.check_execution(code, expected).await);
        } else {
            checks.push(CheckResult::not_run(
                CheckKind::SandboxedExecution,
                "static checks failed",
            ));
        }

        let result = ValidationResult::from_checks(checks);
        tracing::debug!(valid = result.is_valid(), "Validation complete");
        result
    }

    async fn check_execution(&self, code: &str, expected: &FunctionSignature) -> CheckResult {
        let kind = CheckKind::SandboxedExecution;
        let outcome = match self
            .runtime
            .execute(code, &expected.name, &self.sample_input)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return CheckResult::failed(kind, format!("sandbox error: {}", e)),
        };

        match outcome {
            ExecutionOutcome::Returned(serde_json::Value::String(label)) => {
                match label.parse::<Direction>() {
                    Ok(direction) => CheckResult::passed(kind, format!("returned '{}'", direction)),
                    Err(e) => CheckResult::failed(kind, e),
                }
            }
            ExecutionOutcome::Returned(other) => CheckResult::failed(
                kind,
                format!("returned {}, expected one of: up, down", other),
            ),
            ExecutionOutcome::Raised {
                error_type,
                message,
                ..
            } => CheckResult::failed(kind, format!("{}: {}", error_type, message)),
            ExecutionOutcome::TimedOut(timeout) => {
                CheckResult::failed(kind, format!("execution timed out after {:?}", timeout))
            }
            ExecutionOutcome::Crashed { exit_code, stderr } => {
                let stderr: String = stderr.chars().take(MAX_STDERR_CHARS).collect();
                CheckResult::failed(
                    kind,
                    format!("interpreter exited abnormally (exit code {:?}): {}", exit_code, stderr),
                )
            }
        }
    }
}

#[async_trait]
impl CandidateValidator for CodeValidator {
    async fn validate(&self, code: &str, expected: &FunctionSignature) -> ValidationResult {
        CodeValidator::validate(self, code, expected).await
    }
}

fn check_signature(report: &SourceReport, expected: &FunctionSignature) -> CheckResult {
    let kind = CheckKind::Signature;
    // Later definitions shadow earlier ones at import time
    let Some(function) = report.functions.iter().rev().find(|f| f.name == expected.name) else {
        return CheckResult::failed(
            kind,
            format!("function '{}' is not defined at module level", expected.name),
        );
    };

    if function.is_async {
        return CheckResult::failed(
            kind,
            format!("'{}' is declared async, expected a plain function", expected.name),
        );
    }

    if function.params.len() != expected.params.len() {
        return CheckResult::failed(
            kind,
            format!(
                "'{}' takes {} positional parameter(s) ({}), expected {} ({})",
                function.name,
                function.params.len(),
                function.params.join(", "),
                expected.params.len(),
                expected.params.join(", ")
            ),
        );
    }

    CheckResult::passed(kind, format!("{}({})", function.name, function.params.join(", ")))
}

fn check_import_safety(report: &SourceReport, allowed: &[String]) -> CheckResult {
    let violations = import_violations(report, allowed);
    if violations.is_empty() {
        CheckResult::passed(CheckKind::ImportSafety, "all imports allowed")
    } else {
        CheckResult::failed(CheckKind::ImportSafety, violations.join("; "))
    }
}

fn import_violations(report: &SourceReport, allowed: &[String]) -> Vec<String> {
    let mut violations = Vec::new();

    for module in &report.imports {
        let root = module.split('.').next().unwrap_or("");
        if module.starts_with('.') || !allowed.iter().any(|a| a == root) {
            violations.push(format!("unsafe import '{}'", module));
        }
    }
    for name in &report.names {
        if FORBIDDEN_NAMES.contains(&name.as_str()) {
            violations.push(format!("forbidden builtin '{}'", name));
        }
    }
    for attribute in &report.attributes {
        if FORBIDDEN_ATTRIBUTES.contains(&attribute.as_str()) {
            violations.push(format!("forbidden attribute '{}'", attribute));
        }
    }
    // A module handed out by an allowed one still has to be allowed itself
    for reexport in &report.reexports {
        let root = reexport.module.split('.').next().unwrap_or("");
        if !allowed.iter().any(|a| a == root) {
            violations.push(format!(
                "module '{}' reached through '{}'",
                reexport.module, reexport.path
            ));
        }
    }

    violations
}

/// Seven days of plausible BTC candles used as the execution input
pub fn sample_price_data() -> Vec<PricePoint> {
    let closes = [42150.0, 42780.5, 41920.0, 43310.25, 43890.0, 43420.75, 44105.5];
    let volumes = [
        21.4e9, 23.1e9, 19.8e9, 25.6e9, 27.2e9, 22.9e9, 24.3e9,
    ];

    closes
        .iter()
        .zip(volumes.iter())
        .enumerate()
        .map(|(i, (&close, &volume))| {
            let open = if i == 0 { 41800.0 } else { closes[i - 1] };
            PricePoint {
                date: format!("2024-01-{:02}", i + 1),
                open,
                high: open.max(close) * 1.01,
                low: open.min(close) * 0.99,
                close,
                volume,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::python::{test_runtime, FunctionInfo, Reexport};

    fn signature() -> FunctionSignature {
        "predict(price_data)".parse().unwrap()
    }

    fn report_with(functions: Vec<FunctionInfo>, imports: &[&str]) -> SourceReport {
        SourceReport {
            functions,
            imports: imports.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn allowed() -> Vec<String> {
        DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_valid_iff_all_checks_pass() {
        let all_pass: Vec<_> = CheckKind::ORDER
            .iter()
            .map(|&k| CheckResult::passed(k, "ok"))
            .collect();
        assert!(ValidationResult::from_checks(all_pass.clone()).is_valid());

        for i in 0..all_pass.len() {
            let mut checks = all_pass.clone();
            checks[i] = CheckResult::failed(checks[i].kind, "bad");
            let result = ValidationResult::from_checks(checks);
            assert!(!result.is_valid());
            assert_eq!(
                result.is_valid(),
                result.checks().iter().all(|c| c.passed)
            );
        }

        assert!(!ValidationResult::from_checks(Vec::new()).is_valid());
    }

    #[test]
    fn test_error_summary_lists_failures_that_ran() {
        let result = ValidationResult::from_checks(vec![
            CheckResult::passed(CheckKind::Syntax, "parsed"),
            CheckResult::failed(CheckKind::Signature, "function 'predict' is not defined at module level"),
            CheckResult::failed(CheckKind::ImportSafety, "unsafe import 'os'"),
            CheckResult::not_run(CheckKind::SandboxedExecution, "static checks failed"),
        ]);

        assert_eq!(
            result.error_summary(),
            "signature: function 'predict' is not defined at module level\nimport_safety: unsafe import 'os'"
        );
        assert!(!result.check(CheckKind::SandboxedExecution).unwrap().ran);
    }

    #[test]
    fn test_signature_parsing() {
        let sig: FunctionSignature = "def predict(price_data: list, horizon=24):".parse().unwrap();
        assert_eq!(sig.name, "predict");
        assert_eq!(sig.params, vec!["price_data".to_string(), "horizon".to_string()]);
        assert_eq!(sig.to_string(), "predict(price_data, horizon)");

        assert!("predict".parse::<FunctionSignature>().is_err());
        assert!("9lives(x)".parse::<FunctionSignature>().is_err());
        assert!("noargs()".parse::<FunctionSignature>().unwrap().params.is_empty());
    }

    #[test]
    fn test_signature_check_mismatches() {
        let expected = signature();

        let missing = check_signature(&report_with(vec![], &[]), &expected);
        assert!(!missing.passed);
        assert!(missing.detail.contains("not defined"));

        let wrong_arity = check_signature(
            &report_with(
                vec![FunctionInfo {
                    name: "predict".to_string(),
                    params: vec!["a".to_string(), "b".to_string()],
                    is_async: false,
                }],
                &[],
            ),
            &expected,
        );
        assert!(!wrong_arity.passed);
        assert!(wrong_arity.detail.contains("takes 2"));

        let ok = check_signature(
            &report_with(
                vec![FunctionInfo {
                    name: "predict".to_string(),
                    params: vec!["data".to_string()],
                    is_async: false,
                }],
                &[],
            ),
            &expected,
        );
        assert!(ok.passed);
    }

    #[test]
    fn test_import_allow_list() {
        let report = report_with(vec![], &["math", "collections.abc", "os", "urllib.request", ".sibling"]);
        let violations = import_violations(&report, &allowed());

        assert_eq!(
            violations,
            vec![
                "unsafe import 'os'".to_string(),
                "unsafe import 'urllib.request'".to_string(),
                "unsafe import '.sibling'".to_string(),
            ]
        );
    }

    #[test]
    fn test_forbidden_builtins_and_escapes() {
        let report = SourceReport {
            names: vec!["eval".to_string(), "len".to_string()],
            attributes: vec!["__subclasses__".to_string(), "append".to_string()],
            ..Default::default()
        };
        let violations = import_violations(&report, &allowed());

        assert_eq!(
            violations,
            vec![
                "forbidden builtin 'eval'".to_string(),
                "forbidden attribute '__subclasses__'".to_string(),
            ]
        );
    }

    #[test]
    fn test_modules_reached_through_allowed_imports() {
        let report = SourceReport {
            attributes: vec!["os".to_string(), "listdir".to_string(), "__dict__".to_string()],
            reexports: vec![
                Reexport {
                    path: "logging.os".to_string(),
                    module: "os".to_string(),
                },
                Reexport {
                    path: "statistics.math".to_string(),
                    module: "math".to_string(),
                },
            ],
            ..Default::default()
        };
        let violations = import_violations(&report, &allowed());

        assert_eq!(
            violations,
            vec![
                "forbidden attribute 'os'".to_string(),
                "forbidden attribute '__dict__'".to_string(),
                "module 'os' reached through 'logging.os'".to_string(),
            ]
        );
    }

    #[test]
    fn test_sample_price_data_shape() {
        let sample = sample_price_data();
        assert_eq!(sample.len(), 7);
        assert!(sample.iter().all(|p| p.high >= p.low && p.close > 0.0));
        assert_eq!(sample[1].open, sample[0].close);
    }

    async fn validator() -> Option<CodeValidator> {
        let runtime = test_runtime().await?;
        CodeValidator::new(runtime).await.ok()
    }

    #[tokio::test]
    async fn test_valid_candidate_passes_every_check() {
        let Some(validator) = validator().await else { return };
        let code = "import statistics\n\ndef predict(price_data):\n    closes = [d['close'] for d in price_data]\n    return 'up' if closes[-1] > statistics.mean(closes) else 'down'\n";

        let result = validator.validate(code, &signature()).await;
        assert!(result.is_valid(), "{}", result.error_summary());
        assert_eq!(result.checks().len(), 4);
        assert!(result.error_summary().is_empty());
    }

    #[tokio::test]
    async fn test_indentation_error_reported_with_position() {
        let Some(validator) = validator().await else { return };
        let code = "def predict(price_data):\nreturn 'up'\n";

        let result = validator.validate(code, &signature()).await;
        assert!(!result.is_valid());
        assert!(result.error_summary().starts_with("syntax: IndentationError"));
        assert!(result.error_summary().contains("line 2"));
        assert!(result.checks()[1..].iter().all(|c| !c.ran));
    }

    #[tokio::test]
    async fn test_static_failures_are_all_reported_and_code_not_run() {
        let Some(validator) = validator().await else { return };
        let code = "import os\n\ndef forecast(price_data):\n    os.system('true')\n    return 'up'\n";

        let result = validator.validate(code, &signature()).await;
        assert!(!result.is_valid());
        assert!(!result.check(CheckKind::Signature).unwrap().passed);
        assert!(!result.check(CheckKind::ImportSafety).unwrap().passed);
        assert!(!result.check(CheckKind::SandboxedExecution).unwrap().ran);
        assert_eq!(result.error_summary().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_file_access_through_logging_module_is_rejected() {
        let Some(validator) = validator().await else { return };
        let code = "import logging\n\ndef predict(price_data):\n    fd = logging.os.open('/etc/passwd', logging.os.O_RDONLY)\n    logging.os.read(fd, 64)\n    logging.os.listdir('/')\n    return 'up'\n";

        let result = validator.validate(code, &signature()).await;
        assert!(!result.is_valid());
        let imports = result.check(CheckKind::ImportSafety).unwrap();
        assert!(!imports.passed);
        assert!(imports.detail.contains("'logging.os'"), "{}", imports.detail);
        assert!(!result.check(CheckKind::SandboxedExecution).unwrap().ran);

        let aliased = "from logging import os as quiet\n\ndef predict(price_data):\n    quiet.listdir('/')\n    return 'up'\n";
        let result = validator.validate(aliased, &signature()).await;
        assert!(!result.check(CheckKind::ImportSafety).unwrap().passed);
    }

    #[tokio::test]
    async fn test_wrong_label_fails_execution() {
        let Some(validator) = validator().await else { return };
        let code = "def predict(price_data):\n    return 'sideways'\n";

        let result = validator.validate(code, &signature()).await;
        let execution = result.check(CheckKind::SandboxedExecution).unwrap();
        assert!(execution.ran);
        assert!(!execution.passed);
        assert!(execution.detail.contains("sideways"));
    }

    #[tokio::test]
    async fn test_exception_is_a_failing_check() {
        let Some(validator) = validator().await else { return };
        let code = "def predict(price_data):\n    return price_data[100]['close']\n";

        let result = validator.validate(code, &signature()).await;
        assert!(!result.is_valid());
        assert!(result
            .error_summary()
            .starts_with("sandboxed_execution: IndexError"));
    }
}
