//! Layered settings: built-in defaults, then an optional `btcpredict.toml`,
//! then `BTCPREDICT__*` environment variables (e.g.
//! `BTCPREDICT__ENGINE__MAX_ATTEMPTS=6`). Secrets only come from the
//! environment.

use crate::improvement::engine::EngineConfig;
use crate::improvement::python::PythonRuntime;
use crate::improvement::validator::{FunctionSignature, DEFAULT_ALLOWED_IMPORTS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "btcpredict.toml";
const ENV_PREFIX: &str = "BTCPREDICT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} not found in environment")]
    MissingSecret(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/predictor.py`
    pub live_predictor: Option<PathBuf>,
    pub coin_id: String,
    pub history_days: u32,
    pub horizon_hours: u32,
    /// Pause between autonomous cycles (`btcpredict run`)
    pub cycle_interval_hours: u64,
    pub engine: EngineSettings,
    pub sandbox: SandboxSettings,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub generation_timeout_secs: u64,
    pub expected_signature: String,
    /// Ask the LLM why a prediction failed before generating code
    pub analyze_failures: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub python: String,
    pub execution_timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub allowed_imports: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f32,
    pub api_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            live_predictor: None,
            coin_id: "bitcoin".to_string(),
            history_days: 30,
            horizon_hours: 24,
            cycle_interval_hours: 24,
            engine: EngineSettings::default(),
            sandbox: SandboxSettings::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: crate::improvement::engine::DEFAULT_MAX_ATTEMPTS,
            generation_timeout_secs: 120,
            expected_signature: "predict(price_data)".to_string(),
            analyze_failures: true,
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            execution_timeout_secs: 10,
            memory_limit_mb: 512,
            allowed_imports: DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            api_url: None,
        }
    }
}

impl Settings {
    /// Load from `path` (or `btcpredict.toml` when None) plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => ::config::File::from(p).required(true),
            None => ::config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = ::config::Config::builder()
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("sandbox.allowed_imports"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_attempts == 0 {
            return Err(ConfigError::Invalid("engine.max_attempts must be at least 1".to_string()));
        }
        if self.engine.generation_timeout_secs == 0 || self.sandbox.execution_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if self.cycle_interval_hours == 0 {
            return Err(ConfigError::Invalid("cycle_interval_hours must be positive".to_string()));
        }
        if self.horizon_hours == 0 {
            return Err(ConfigError::Invalid("horizon_hours must be positive".to_string()));
        }
        if self.history_days < 5 {
            return Err(ConfigError::Invalid(
                "history_days must cover at least 5 days".to_string(),
            ));
        }
        self.signature()?;
        Ok(())
    }

    pub fn signature(&self) -> Result<FunctionSignature, ConfigError> {
        self.engine
            .expected_signature
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("engine.expected_signature: {}", e)))
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            max_attempts: self.engine.max_attempts,
            generation_timeout: Duration::from_secs(self.engine.generation_timeout_secs),
            expected_signature: self.signature()?,
        })
    }

    pub fn python_runtime(&self) -> PythonRuntime {
        PythonRuntime::new(&self.sandbox.python)
            .with_execution_timeout(Duration::from_secs(self.sandbox.execution_timeout_secs))
            .with_memory_limit(self.sandbox.memory_limit_mb * 1024 * 1024)
    }

    pub fn live_predictor_path(&self) -> PathBuf {
        self.live_predictor
            .clone()
            .unwrap_or_else(|| self.data_dir.join("predictor.py"))
    }

    pub fn patterns_path(&self) -> PathBuf {
        self.data_dir.join("patterns.jsonl")
    }

    pub fn improvements_path(&self) -> PathBuf {
        self.data_dir.join("improvements.jsonl")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.data_dir.join("predictions.jsonl")
    }

    pub fn analyses_path(&self) -> PathBuf {
        self.data_dir.join("analyses.jsonl")
    }
}

pub fn openai_api_key() -> Result<String, ConfigError> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or(ConfigError::MissingSecret("OPENAI_API_KEY"))
}

pub fn coingecko_api_key() -> Option<String> {
    std::env::var("COINGECKO_API_KEY").ok().filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();

        assert_eq!(settings.engine.max_attempts, 4);
        assert!(settings.engine.analyze_failures);
        assert_eq!(settings.cycle_interval_hours, 24);
        assert_eq!(settings.live_predictor_path(), PathBuf::from("data/predictor.py"));
        assert_eq!(settings.signature().unwrap().name, "predict");
        assert!(settings.sandbox.allowed_imports.contains(&"statistics".to_string()));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/tmp/btc"
horizon_hours = 48

[engine]
max_attempts = 6
analyze_failures = false

[sandbox]
allowed_imports = ["math"]
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();

        assert_eq!(settings.data_dir, PathBuf::from("/tmp/btc"));
        assert_eq!(settings.horizon_hours, 48);
        assert_eq!(settings.engine.max_attempts, 6);
        assert_eq!(settings.engine.generation_timeout_secs, 120);
        assert!(!settings.engine.analyze_failures);
        assert_eq!(settings.analyses_path(), PathBuf::from("/tmp/btc/analyses.jsonl"));
        assert_eq!(settings.sandbox.allowed_imports, vec!["math".to_string()]);
        assert_eq!(settings.patterns_path(), PathBuf::from("/tmp/btc/patterns.jsonl"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine]\nmax_attempts = 0\n").unwrap();

        assert!(matches!(Settings::load(Some(&path)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let settings = Settings {
            engine: EngineSettings {
                expected_signature: "predict".to_string(),
                ..EngineSettings::default()
            },
            ..Settings::default()
        };
        assert!(settings.engine_config().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(Settings::load(Some(&missing)), Err(ConfigError::Load(_))));
    }
}
