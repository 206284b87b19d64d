use super::engine::ImprovementAttempt;
use crate::journal::{append_line, read_lines};
use crate::llm::GenerationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One finished session as written to `improvements.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub session_id: Uuid,
    pub status: String,
    pub reason: String,
    pub prediction_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<ImprovementAttempt>,
    /// Failure analysis fed into the prompts, if one was produced
    #[serde(default)]
    pub analysis_id: Option<Uuid>,
    #[serde(default)]
    pub generation_error: Option<GenerationError>,
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    #[serde(default)]
    pub deployment_error: Option<String>,
}

/// Append-only log of improvement sessions
#[derive(Debug, Clone)]
pub struct ImprovementLog {
    path: PathBuf,
}

impl ImprovementLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &SessionLogEntry) -> std::io::Result<()> {
        append_line(&self.path, entry)
    }

    pub fn entries(&self) -> std::io::Result<Vec<SessionLogEntry>> {
        read_lines(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::validator::{CheckKind, CheckResult, ValidationResult};
    use tempfile::TempDir;

    #[test]
    fn test_entries_keep_every_attempt_field() {
        let dir = TempDir::new().unwrap();
        let log = ImprovementLog::new(dir.path().join("improvements.jsonl"));

        let attempt = ImprovementAttempt {
            attempt_number: 1,
            generated_code: "def predict(price_data):\n    return 'up'\n".to_string(),
            validation_result: ValidationResult::from_checks(vec![CheckResult::failed(
                CheckKind::Syntax,
                "SyntaxError: invalid syntax (line 1)",
            )]),
            focus_strategy: "baseline".to_string(),
            category: None,
            description: None,
            changes_made: vec![],
            timestamp: Utc::now(),
        };
        let entry = SessionLogEntry {
            session_id: Uuid::new_v4(),
            status: "exhausted".to_string(),
            reason: "manual".to_string(),
            prediction_id: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            attempts: vec![attempt],
            analysis_id: None,
            generation_error: Some(GenerationError::Timeout(std::time::Duration::from_secs(3))),
            deployment_id: None,
            deployment_error: None,
        };

        log.append(&entry).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries, vec![entry]);
    }
}
