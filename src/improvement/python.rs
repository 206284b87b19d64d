//! Python subprocess backend for candidate inspection and sandboxed execution.
//!
//! Candidate code never runs inside this process. Static inspection parses it
//! with `ast` in a child interpreter; execution runs it in a throwaway
//! directory under an audit hook, with a wall-clock timeout enforced here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const INSPECTOR_SCRIPT: &str = r#"
import ast, importlib, json, sys, types

src = sys.stdin.buffer.read().decode("utf-8", "replace")
try:
    tree = ast.parse(src, filename="<candidate>")
except (SyntaxError, ValueError) as e:
    print(json.dumps({"syntax_error": {
        "kind": type(e).__name__,
        "message": getattr(e, "msg", None) or str(e),
        "line": getattr(e, "lineno", None),
        "column": getattr(e, "offset", None),
    }}))
    sys.exit(0)

functions = []
for node in tree.body:
    if isinstance(node, (ast.FunctionDef, ast.AsyncFunctionDef)):
        a = node.args
        functions.append({
            "name": node.name,
            "params": [p.arg for p in getattr(a, "posonlyargs", []) + a.args],
            "is_async": isinstance(node, ast.AsyncFunctionDef),
        })

imports, names, attributes = [], set(), set()
for node in ast.walk(tree):
    if isinstance(node, ast.Import):
        imports.extend(alias.name for alias in node.names)
    elif isinstance(node, ast.ImportFrom):
        imports.append("." * node.level + (node.module or ""))
    elif isinstance(node, ast.Name):
        names.add(node.id)
    elif isinstance(node, ast.Attribute):
        attributes.add(node.attr)

TRUSTED = set(sys.argv[1:])

def reached_modules(chain):
    # Only trusted roots are imported; anything else is already an import violation
    if chain[0] not in TRUSTED:
        return []
    try:
        obj = importlib.import_module(chain[0])
    except Exception:
        return []
    found = []
    for i, attr in enumerate(chain[1:], start=2):
        value = getattr(obj, attr, None)
        if value is None and isinstance(obj, types.ModuleType):
            try:
                value = importlib.import_module(obj.__name__ + "." + attr)
            except Exception:
                return found
        if not isinstance(value, types.ModuleType):
            return found
        if value.__name__.split(".")[0] != chain[0]:
            found.append({"path": ".".join(chain[:i]), "module": value.__name__})
        obj = value
    return found

bindings, chains = {}, []
for node in ast.walk(tree):
    if isinstance(node, ast.Import):
        for alias in node.names:
            if alias.asname:
                bindings[alias.asname] = alias.name.split(".")
            else:
                root = alias.name.split(".")[0]
                bindings[root] = [root]
    elif isinstance(node, ast.ImportFrom) and node.level == 0 and node.module:
        for alias in node.names:
            if alias.name != "*":
                chain = node.module.split(".") + [alias.name]
                bindings[alias.asname or alias.name] = chain
                chains.append(chain)

for node in ast.walk(tree):
    if isinstance(node, ast.Attribute):
        parts, base = [], node
        while isinstance(base, ast.Attribute):
            parts.append(base.attr)
            base = base.value
        if isinstance(base, ast.Name) and base.id in bindings:
            chains.append(bindings[base.id] + parts[::-1])

reexports = {}
for chain in chains:
    for found in reached_modules(chain):
        reexports[found["path"]] = found

print(json.dumps({
    "syntax_error": None,
    "functions": functions,
    "imports": imports,
    "names": sorted(names),
    "attributes": sorted(attributes),
    "reexports": [reexports[k] for k in sorted(reexports)],
}))
"#;

const HARNESS_SCRIPT: &str = r#"
import json, os, sys, traceback

def make_emit(stream, token):
    def emit(payload):
        payload["nonce"] = token
        stream.write(json.dumps(payload) + "\n")
        stream.flush()
    return emit

path, entry, cpu_secs, mem_bytes = sys.argv[1], sys.argv[2], int(sys.argv[3]), int(sys.argv[4])
try:
    import resource
    resource.setrlimit(resource.RLIMIT_CPU, (cpu_secs, cpu_secs))
    resource.setrlimit(resource.RLIMIT_AS, (mem_bytes, mem_bytes))
except Exception:
    pass

request = json.loads(sys.stdin.buffer.read().decode("utf-8"))
emit = make_emit(sys.stdout, request.pop("nonce"))
data = request.pop("input")
del request
with open(path, "r", encoding="utf-8") as f:
    source = f.read()

# Reads are confined to the sandbox dir and the interpreter's own library path
READ_ROOTS = tuple([os.path.realpath(os.path.dirname(path))] +
                   [os.path.realpath(p) for p in sys.path if p and os.path.isdir(p)])
BLOCKED = ("socket.", "subprocess.", "os.system", "os.exec", "os.spawn", "os.posix_spawn",
           "os.fork", "os.kill", "os.remove", "os.rename", "os.rmdir", "os.mkdir", "os.unlink",
           "os.chmod", "os.chown", "os.truncate", "os.link", "os.symlink", "os.chdir",
           "os.chroot", "os.putenv", "os.unsetenv", "os.utime", "os.chflags", "os.lchflags",
           "os.setxattr", "os.removexattr", "os.listxattr", "os.startfile", "shutil.", "ctypes.",
           "urllib.", "http.", "ftplib.", "smtplib.", "webbrowser.", "import.pth", "glob.",
           "pty.", "fcntl.", "mmap.", "signal.", "resource.", "gc.get_", "sys.addaudithook",
           "sys.settrace", "sys.setprofile", "sys._current_frames")
PATH_EVENTS = ("os.listdir", "os.scandir")
WRITE_FLAGS = os.O_WRONLY | os.O_RDWR | os.O_CREAT | os.O_APPEND | os.O_TRUNC

def readable(target):
    if not isinstance(target, (str, bytes, os.PathLike)):
        return False
    try:
        resolved = os.path.realpath(os.fsdecode(target))
    except Exception:
        return False
    return any(resolved == root or resolved.startswith(root + os.sep) for root in READ_ROOTS)

def audit(event, args):
    if event == "open":
        mode = args[1] if len(args) > 1 else None
        flags = args[2] if len(args) > 2 else 0
        if isinstance(mode, str) and any(c in mode for c in "wax+"):
            raise PermissionError("sandbox: write access denied")
        if isinstance(flags, int) and flags & WRITE_FLAGS:
            raise PermissionError("sandbox: write access denied")
        if not readable(args[0] if args else None):
            raise PermissionError("sandbox: read access denied")
    elif event in PATH_EVENTS:
        target = args[0] if args and args[0] is not None else "."
        if not readable(target):
            raise PermissionError("sandbox: %s denied" % event)
    elif event.startswith(BLOCKED):
        raise PermissionError("sandbox: %s denied" % event)

sys.addaudithook(audit)

try:
    namespace = {"__name__": "candidate"}
    exec(compile(source, "candidate.py", "exec"), namespace)
    fn = namespace.get(entry)
    if not callable(fn):
        outcome = {"status": "raised", "error_type": "TypeError",
                   "message": "entry point %r is missing or not callable" % entry}
    else:
        value = fn(data)
        if value is not None and not isinstance(value, (str, int, float, bool)):
            value = repr(value)
        outcome = {"status": "returned", "value": value}
except BaseException as e:
    outcome = {"status": "raised", "error_type": type(e).__name__, "message": str(e),
               "traceback": traceback.format_exc(limit=5)}

emit(outcome)
"#;

#[derive(Debug, Error)]
pub enum PythonError {
    #[error("failed to run python interpreter '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("python interpreter '{0}' is not usable: {1}")]
    Unusable(String, String),

    #[error("inspector timed out after {0:?}")]
    InspectTimeout(Duration),

    #[error("inspector produced unreadable output: {0}")]
    Protocol(String),

    #[error("sandbox setup failed: {0}")]
    Setup(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxErrorInfo {
    pub kind: String,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl std::fmt::Display for SyntaxErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, " (line {}, column {})", line, column),
            (Some(line), None) => write!(f, " (line {})", line),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub params: Vec<String>,
    #[serde(default)]
    pub is_async: bool,
}

/// What the AST inspector found in a candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceReport {
    pub syntax_error: Option<SyntaxErrorInfo>,
    #[serde(default)]
    pub functions: Vec<FunctionInfo>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub reexports: Vec<Reexport>,
}

/// A module handed out by an imported one, e.g. `logging.os`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reexport {
    /// Dotted path as written in the candidate
    pub path: String,
    /// Real name of the module it resolves to
    pub module: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Entry point returned; non-primitive values arrive as their repr
    Returned(serde_json::Value),
    Raised {
        error_type: String,
        message: String,
        traceback: Option<String>,
    },
    TimedOut(Duration),
    Crashed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// Only a line carrying the per-run nonce counts as the harness result;
/// anything else on stdout came from the candidate
#[derive(Debug, Deserialize)]
struct HarnessEnvelope {
    nonce: String,
    #[serde(flatten)]
    reply: HarnessReply,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HarnessReply {
    Returned {
        value: serde_json::Value,
    },
    Raised {
        error_type: String,
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PythonRuntime {
    interpreter: PathBuf,
    inspect_timeout: Duration,
    execution_timeout: Duration,
    memory_limit_bytes: u64,
}

impl PythonRuntime {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            inspect_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(30),
            memory_limit_bytes: 512 * 1024 * 1024,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_inspect_timeout(mut self, timeout: Duration) -> Self {
        self.inspect_timeout = timeout;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        // -I: isolated (no env vars, no user site, no cwd on sys.path)
        // -B: never write bytecode
        cmd.arg("-I")
            .arg("-B")
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> PythonError {
        PythonError::Spawn {
            interpreter: self.interpreter.display().to_string(),
            source,
        }
    }

    /// Check the interpreter exists and is Python 3.8+ (audit hooks)
    pub async fn check_version(&self) -> Result<String, PythonError> {
        let output = Command::new(&self.interpreter)
            .arg("-c")
            .arg("import sys; print('%d.%d.%d' % sys.version_info[:3]); sys.exit(0 if sys.version_info >= (3, 8) else 1)")
            .env_clear()
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(PythonError::Unusable(
                self.interpreter.display().to_string(),
                format!("need Python >= 3.8, found '{}'", version),
            ));
        }
        Ok(version)
    }

    /// Parse (never execute) the source and report its structure
    ///
    /// `trusted_modules` may be imported by the inspector to resolve
    /// attribute chains; the candidate itself is never run.
    pub async fn inspect(
        &self,
        source: &str,
        trusted_modules: &[String],
    ) -> Result<SourceReport, PythonError> {
        let mut child = self
            .base_command()
            .arg("-c")
            .arg(INSPECTOR_SCRIPT)
            .args(trusted_modules)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(source.as_bytes()).await?;
            // stdin drops here so the inspector sees EOF
        }

        let output = match tokio::time::timeout(self.inspect_timeout, child.wait_with_output()).await
        {
            Ok(result) => result?,
            Err(_) => return Err(PythonError::InspectTimeout(self.inspect_timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        serde_json::from_str(line).map_err(|e| {
            PythonError::Protocol(format!(
                "{} (exit {:?}, stderr: {})",
                e,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        })
    }

    /// Run `entry(input)` from the source in a throwaway sandbox process
    ///
    /// Only setup problems are errors; anything the candidate does wrong
    /// comes back as an `ExecutionOutcome`.
    pub async fn execute<T: Serialize>(
        &self,
        source: &str,
        entry: &str,
        input: &T,
    ) -> Result<ExecutionOutcome, PythonError> {
        let workdir = tempfile::Builder::new().prefix("btcpredict-sandbox-").tempdir()?;
        let module_path = workdir.path().join("candidate.py");
        tokio::fs::write(&module_path, source).await?;

        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let input = serde_json::to_value(input).map_err(std::io::Error::from)?;
        let payload = serde_json::to_vec(&serde_json::json!({ "nonce": nonce, "input": input }))
            .map_err(std::io::Error::from)?;
        let cpu_secs = self.execution_timeout.as_secs().max(1) + 1;

        let mut child = self
            .base_command()
            .arg("-S")
            .arg("-c")
            .arg(HARNESS_SCRIPT)
            .arg(&module_path)
            .arg(entry)
            .arg(cpu_secs.to_string())
            .arg(self.memory_limit_bytes.to_string())
            .current_dir(workdir.path())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A candidate that exits early closes the pipe; that shows up below
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!("sandbox stdin closed early: {}", e);
            }
        }

        let output =
            match tokio::time::timeout(self.execution_timeout, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    // Dropping the wait future drops the child, which kills it
                    tracing::warn!(timeout = ?self.execution_timeout, "sandboxed execution timed out");
                    return Ok(ExecutionOutcome::TimedOut(self.execution_timeout));
                }
            };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = stdout
            .lines()
            .rev()
            .filter_map(|l| serde_json::from_str::<HarnessEnvelope>(l).ok())
            .find(|envelope| envelope.nonce == nonce)
            .map(|envelope| envelope.reply);

        Ok(match reply {
            Some(HarnessReply::Returned { value }) => ExecutionOutcome::Returned(value),
            Some(HarnessReply::Raised {
                error_type,
                message,
                traceback,
            }) => ExecutionOutcome::Raised {
                error_type,
                message,
                traceback,
            },
            None => ExecutionOutcome::Crashed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
        })
    }
}

/// Locate a usable interpreter for tests
///
/// Panics when python3 is missing unless BTCPREDICT_SKIP_PYTHON_TESTS is set,
/// in which case the caller skips.
#[cfg(test)]
pub(crate) async fn test_runtime() -> Option<PythonRuntime> {
    let runtime = PythonRuntime::new("python3");
    match runtime.check_version().await {
        Ok(_) => Some(runtime),
        Err(e) if std::env::var_os("BTCPREDICT_SKIP_PYTHON_TESTS").is_some() => {
            tracing::warn!("skipping python-backed test: {}", e);
            None
        }
        Err(e) => panic!(
            "python3 >= 3.8 is required for this test ({}); set BTCPREDICT_SKIP_PYTHON_TESTS=1 to skip",
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inspect_reports_structure() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "import math\nfrom statistics import mean\n\ndef predict(price_data, *rest):\n    return 'up'\n";

        let report = runtime.inspect(source, &[]).await.unwrap();
        assert!(report.syntax_error.is_none());
        assert_eq!(report.functions.len(), 1);
        assert_eq!(report.functions[0].name, "predict");
        assert_eq!(report.functions[0].params, vec!["price_data".to_string()]);
        assert_eq!(report.imports, vec!["math".to_string(), "statistics".to_string()]);
    }

    #[tokio::test]
    async fn test_inspect_indentation_error() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "def predict(price_data):\nreturn 'up'\n";

        let report = runtime.inspect(source, &[]).await.unwrap();
        let error = report.syntax_error.unwrap();
        assert_eq!(error.kind, "IndentationError");
        assert_eq!(error.line, Some(2));
        assert!(error.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_inspect_never_executes() {
        let Some(runtime) = test_runtime().await else { return };
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let source = format!(
            "open({:?}, 'w').write('x')\ndef predict(price_data):\n    return 'up'\n",
            marker.display().to_string()
        );

        runtime.inspect(&source, &[]).await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_execute_returns_value() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "def predict(price_data):\n    return 'up' if price_data[-1]['close'] > 1 else 'down'\n";
        let input = serde_json::json!([{ "close": 5.0 }]);

        let outcome = runtime.execute(source, "predict", &input).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Returned(serde_json::json!("up")));
    }

    #[tokio::test]
    async fn test_execute_reports_exception() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "def predict(price_data):\n    return 1 / 0\n";

        let outcome = runtime
            .execute(source, "predict", &serde_json::json!([]))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Raised { error_type, .. } => assert_eq!(error_type, "ZeroDivisionError"),
            other => panic!("expected Raised, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let Some(runtime) = test_runtime().await else { return };
        let runtime = runtime.with_execution_timeout(Duration::from_millis(500));
        let source = "def predict(price_data):\n    while True:\n        pass\n";

        let outcome = runtime
            .execute(source, "predict", &serde_json::json!([]))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::TimedOut(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_execute_blocks_file_writes() {
        let Some(runtime) = test_runtime().await else { return };
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("leak.txt");
        let source = format!(
            "def predict(price_data):\n    open({:?}, 'w').write('x')\n    return 'up'\n",
            target.display().to_string()
        );

        let outcome = runtime
            .execute(&source, "predict", &serde_json::json!([]))
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Raised { ref error_type, .. } if error_type == "PermissionError"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_execute_confines_reads_to_sandbox() {
        let Some(runtime) = test_runtime().await else { return };
        let dir = tempfile::TempDir::new().unwrap();
        let secret = dir.path().join("secret.txt");
        std::fs::write(&secret, "api-key").unwrap();

        for body in [
            format!("open({:?}).read()", secret.display().to_string()),
            "import os\n    os.open('/etc/passwd', os.O_RDONLY)".to_string(),
            "import os\n    os.listdir('/')".to_string(),
            "import os\n    os.chdir('/')".to_string(),
        ] {
            let source = format!("def predict(price_data):\n    {}\n    return 'up'\n", body);
            let outcome = runtime
                .execute(&source, "predict", &serde_json::json!([]))
                .await
                .unwrap();
            assert!(
                matches!(outcome, ExecutionOutcome::Raised { ref error_type, .. } if error_type == "PermissionError"),
                "{}: {:?}",
                body,
                outcome
            );
        }
    }

    #[tokio::test]
    async fn test_execute_still_imports_stdlib_lazily() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "def predict(price_data):\n    import statistics, fractions\n    return 'up' if statistics.mean([1, 2]) > fractions.Fraction(1, 2) else 'down'\n";

        let outcome = runtime
            .execute(source, "predict", &serde_json::json!([]))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Returned(serde_json::json!("up")));
    }

    #[tokio::test]
    async fn test_forged_result_line_is_not_trusted() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "import json, os\n\ndef predict(price_data):\n    print(json.dumps({'status': 'returned', 'value': 'up'}), flush=True)\n    os._exit(0)\n";

        let outcome = runtime
            .execute(source, "predict", &serde_json::json!([]))
            .await
            .unwrap();
        assert!(
            matches!(outcome, ExecutionOutcome::Crashed { exit_code: Some(0), .. }),
            "{:?}",
            outcome
        );
    }

    #[tokio::test]
    async fn test_inspect_reports_module_reexports() {
        let Some(runtime) = test_runtime().await else { return };
        let source = "import logging\nimport collections.abc\nfrom json import decoder\nfrom logging import os as o\n\ndef predict(price_data):\n    logging.os.listdir('/')\n    collections.abc.Mapping\n    return 'up'\n";

        let trusted: Vec<String> = ["logging", "collections", "json"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let report = runtime.inspect(source, &trusted).await.unwrap();
        assert_eq!(
            report.reexports,
            vec![Reexport {
                path: "logging.os".to_string(),
                module: "os".to_string(),
            }],
            "{:?}",
            report
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_version_check() {
        let runtime = PythonRuntime::new("/nonexistent/python3");
        assert!(matches!(runtime.check_version().await, Err(PythonError::Spawn { .. })));
    }
}
