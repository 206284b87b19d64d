// Live predictor: runs whatever module is deployed, through the same sandbox
// used for validating candidates.

pub mod history;

pub use history::PredictionJournal;

use crate::improvement::python::{ExecutionOutcome, PythonError, PythonRuntime};
use crate::improvement::validator::FunctionSignature;
use crate::models::{Candle, Direction, PricePoint};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Shipped implementation installed by `init`
pub const BASELINE_PREDICTOR: &str = include_str!("baseline.py");

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("no live predictor at {0}")]
    NoLiveCode(PathBuf),

    #[error("failed to read live predictor: {0}")]
    Read(#[source] std::io::Error),

    #[error(transparent)]
    Runtime(#[from] PythonError),

    #[error("live predictor raised {error_type}: {message}")]
    Raised { error_type: String, message: String },

    #[error("live predictor timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("live predictor crashed (exit code {exit_code:?}): {stderr}")]
    Crashed { exit_code: Option<i32>, stderr: String },

    #[error("live predictor returned an invalid label: {0}")]
    InvalidLabel(String),
}

impl PredictError {
    /// Failures caused by the predictor code itself, as opposed to setup
    pub fn is_code_failure(&self) -> bool {
        matches!(
            self,
            PredictError::Raised { .. }
                | PredictError::TimedOut(_)
                | PredictError::Crashed { .. }
                | PredictError::InvalidLabel(_)
        )
    }
}

pub struct LivePredictor {
    path: PathBuf,
    runtime: PythonRuntime,
    entry: FunctionSignature,
}

impl LivePredictor {
    pub fn new(path: impl Into<PathBuf>, runtime: PythonRuntime, entry: FunctionSignature) -> Self {
        Self {
            path: path.into(),
            runtime,
            entry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> Result<String, PredictError> {
        match std::fs::read_to_string(&self.path) {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PredictError::NoLiveCode(self.path.clone()))
            }
            Err(e) => Err(PredictError::Read(e)),
        }
    }

    /// Run the deployed `predict` over the candles (oldest first)
    pub async fn predict(&self, candles: &[Candle]) -> Result<Direction, PredictError> {
        // One read, so a concurrent deploy can't hand us a mix
        let source = self.source()?;
        let price_data: Vec<PricePoint> = candles.iter().map(PricePoint::from).collect();

        let outcome = self
            .runtime
            .execute(&source, &self.entry.name, &price_data)
            .await?;

        match outcome {
            ExecutionOutcome::Returned(serde_json::Value::String(label)) => label
                .parse::<Direction>()
                .map_err(|_| PredictError::InvalidLabel(label)),
            ExecutionOutcome::Returned(other) => Err(PredictError::InvalidLabel(other.to_string())),
            ExecutionOutcome::Raised {
                error_type,
                message,
                ..
            } => Err(PredictError::Raised {
                error_type,
                message,
            }),
            ExecutionOutcome::TimedOut(timeout) => Err(PredictError::TimedOut(timeout)),
            ExecutionOutcome::Crashed { exit_code, stderr } => {
                Err(PredictError::Crashed { exit_code, stderr })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::python::test_runtime;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn candles(closes: &[f64], volumes: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::days(closes.len() as i64);
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&close, &volume))| Candle {
                token: "bitcoin".to_string(),
                timestamp: start + Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume,
            })
            .collect()
    }

    fn signature() -> FunctionSignature {
        "predict(price_data)".parse().unwrap()
    }

    #[tokio::test]
    async fn test_missing_live_code() {
        let dir = TempDir::new().unwrap();
        let predictor = LivePredictor::new(
            dir.path().join("predictor.py"),
            PythonRuntime::new("python3"),
            signature(),
        );

        let result = predictor.predict(&[]).await;
        assert!(matches!(result, Err(PredictError::NoLiveCode(_))));
    }

    #[tokio::test]
    async fn test_baseline_follows_trend() {
        let Some(runtime) = test_runtime().await else { return };
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("predictor.py");
        std::fs::write(&path, BASELINE_PREDICTOR).unwrap();
        let predictor = LivePredictor::new(&path, runtime, signature());

        let rising = candles(
            &[100.0, 101.0, 102.0, 104.0, 106.0, 108.0, 111.0],
            &[10.0, 10.0, 10.0, 10.0, 10.0, 12.0, 14.0],
        );
        let falling = candles(
            &[111.0, 108.0, 106.0, 104.0, 102.0, 101.0, 100.0],
            &[10.0; 7],
        );

        assert_eq!(predictor.predict(&rising).await.unwrap(), Direction::Up);
        assert_eq!(predictor.predict(&falling).await.unwrap(), Direction::Down);
        assert_eq!(predictor.predict(&rising[..3]).await.unwrap(), Direction::Down);
    }

    #[tokio::test]
    async fn test_crashing_predictor_is_code_failure() {
        let Some(runtime) = test_runtime().await else { return };
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("predictor.py");
        std::fs::write(&path, "def predict(price_data):\n    raise ValueError('boom')\n").unwrap();
        let predictor = LivePredictor::new(&path, runtime, signature());

        let error = predictor.predict(&[]).await.unwrap_err();
        assert!(error.is_code_failure());
        assert!(error.to_string().contains("ValueError"));
    }
}
