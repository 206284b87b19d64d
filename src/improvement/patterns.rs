//! Append-only history of correction outcomes, one JSON record per line.
//!
//! Statistics are never stored; they are recomputed from the full history
//! on every read so a restart sees exactly what was appended before it.

use super::classifier::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::journal::{append_line, read_lines};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOutcome {
    Success,
    Failure,
}

/// One completed attempt: which category it was about, what guidance was used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub strategy_used: String,
    pub outcome: PatternOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl ErrorPattern {
    pub fn new(category: ErrorCategory, strategy_used: impl Into<String>, outcome: PatternOutcome) -> Self {
        Self {
            category,
            strategy_used: strategy_used.into(),
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// Derived view over the history for one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternStatistics {
    pub category: ErrorCategory,
    pub total: usize,
    pub successes: usize,
    /// 0.0 when there is no history
    pub success_rate: f64,
    pub best_strategy: Option<String>,
}

impl PatternStatistics {
    pub fn is_cold(&self) -> bool {
        self.total == 0
    }
}

pub struct PatternStore {
    path: PathBuf,
    history: Mutex<Vec<ErrorPattern>>,
}

impl PatternStore {
    /// Open (or create on first record) the store at `path`
    ///
    /// Unreadable lines are skipped with a warning rather than failing the load.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let history = load_history(&path);

        tracing::debug!(
            path = %path.display(),
            records = history.len(),
            "Loaded error pattern history"
        );

        Self {
            path,
            history: Mutex::new(history),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a pattern. Never fails: persistence problems are logged and the
    /// record is still kept in memory for this process.
    pub fn record(&self, pattern: ErrorPattern) {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Holding the lock while appending keeps lines whole across threads
        if let Err(e) = append_line(&self.path, &pattern) {
            tracing::warn!(
                path = %self.path.display(),
                "Failed to persist error pattern: {}",
                e
            );
        }

        tracing::debug!(
            category = %pattern.category,
            strategy = %pattern.strategy_used,
            outcome = ?pattern.outcome,
            "Recorded error pattern"
        );
        history.push(pattern);
    }

    pub fn statistics(&self, category: ErrorCategory) -> PatternStatistics {
        let history = self.snapshot();
        let mut total = 0;
        let mut successes = 0;
        let mut by_strategy: HashMap<&str, usize> = HashMap::new();

        for pattern in history.iter().filter(|p| p.category == category) {
            total += 1;
            if pattern.outcome == PatternOutcome::Success {
                successes += 1;
                *by_strategy.entry(pattern.strategy_used.as_str()).or_default() += 1;
            }
        }

        // Ties break on the strategy name so the answer never depends on map order
        let best_strategy = by_strategy
            .into_iter()
            .max_by(|(a_name, a_count), (b_name, b_count)| {
                a_count.cmp(b_count).then_with(|| b_name.cmp(a_name))
            })
            .map(|(name, _)| name.to_string());

        PatternStatistics {
            category,
            total,
            successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            best_strategy,
        }
    }

    /// None until at least one success exists for the category
    pub fn best_strategy_for(&self, category: ErrorCategory) -> Option<String> {
        self.statistics(category).best_strategy
    }

    pub fn all_statistics(&self) -> Vec<PatternStatistics> {
        ErrorCategory::ALL
            .into_iter()
            .map(|c| self.statistics(c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ErrorPattern> {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn load_history(path: &Path) -> Vec<ErrorPattern> {
    match read_lines(path) {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Cannot read pattern history: {}", e);
            Vec::new()
        }
    }
}
