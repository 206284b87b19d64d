//! One full improvement session: explain the failure, run the engine, put the
//! winner live, tell whoever is listening.

use crate::deployment::{DeploymentError, DeploymentManager, DeploymentMeta, DeploymentRecord};
use crate::improvement::{
    AnalysisLog, EngineOutcome, FailureAnalysis, FailureAnalyzer, ImprovementAttempt,
    ImprovementEngine, ImprovementLog, ImprovementRequest, SessionLogEntry,
};
use crate::llm::GenerationError;
use crate::notify::DeploymentNotifier;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
pub enum SessionResult {
    Deployed {
        record: DeploymentRecord,
        attempt: ImprovementAttempt,
    },
    Exhausted {
        attempts: Vec<ImprovementAttempt>,
    },
    GenerationFailed {
        attempt_number: u32,
        error: GenerationError,
        attempts: Vec<ImprovementAttempt>,
    },
    /// A candidate validated but could not be put live; the old code stays
    DeploymentFailed {
        error: DeploymentError,
        attempt: ImprovementAttempt,
        attempts: Vec<ImprovementAttempt>,
    },
    Cancelled {
        attempts: Vec<ImprovementAttempt>,
    },
}

impl SessionResult {
    pub fn status(&self) -> &'static str {
        match self {
            SessionResult::Deployed { .. } => "deployed",
            SessionResult::Exhausted { .. } => "exhausted",
            SessionResult::GenerationFailed { .. } => "generation_failed",
            SessionResult::DeploymentFailed { .. } => "deployment_failed",
            SessionResult::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_deployed(&self) -> bool {
        matches!(self, SessionResult::Deployed { .. })
    }

    /// Number of generate+validate iterations the session went through
    pub fn attempt_count(&self) -> usize {
        match self {
            SessionResult::Deployed { attempt, .. } => attempt.attempt_number as usize,
            SessionResult::Exhausted { attempts }
            | SessionResult::GenerationFailed { attempts, .. }
            | SessionResult::DeploymentFailed { attempts, .. }
            | SessionResult::Cancelled { attempts } => attempts.len(),
        }
    }
}

impl fmt::Display for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionResult::Deployed { record, attempt } => write!(
                f,
                "deployed {} on attempt {} (backup {})",
                record.deployment_id, attempt.attempt_number, record.backup_path
            ),
            SessionResult::Exhausted { attempts } => {
                write!(f, "no valid candidate after {} attempts", attempts.len())
            }
            SessionResult::GenerationFailed {
                attempt_number,
                error,
                ..
            } => write!(f, "generation failed on attempt {}: {}", attempt_number, error),
            SessionResult::DeploymentFailed { error, attempt, .. } => write!(
                f,
                "attempt {} validated but deployment failed: {}",
                attempt.attempt_number, error
            ),
            SessionResult::Cancelled { attempts } => {
                write!(f, "cancelled after {} attempts", attempts.len())
            }
        }
    }
}

pub struct SelfImprovementLoop {
    engine: ImprovementEngine,
    deployments: Arc<DeploymentManager>,
    notifier: Option<Arc<dyn DeploymentNotifier>>,
    analyzer: Option<Arc<dyn FailureAnalyzer>>,
    analysis_log: Option<AnalysisLog>,
    log: Option<ImprovementLog>,
}

impl SelfImprovementLoop {
    pub fn new(engine: ImprovementEngine, deployments: Arc<DeploymentManager>) -> Self {
        Self {
            engine,
            deployments,
            notifier: None,
            analyzer: None,
            analysis_log: None,
            log: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DeploymentNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Diagnose the failure before the first attempt
    pub fn with_analyzer(mut self, analyzer: Arc<dyn FailureAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_analysis_log(mut self, log: AnalysisLog) -> Self {
        self.analysis_log = Some(log);
        self
    }

    /// Record every finished session, deployment outcome included
    pub fn with_log(mut self, log: ImprovementLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn engine(&self) -> &ImprovementEngine {
        &self.engine
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Returns the session id alongside the result
    pub async fn run(
        &self,
        request: &ImprovementRequest,
        cancel: &CancellationToken,
    ) -> (Uuid, SessionResult) {
        let analysis = match request.context.analysis {
            Some(_) => None,
            None => self.analyze(request, cancel).await,
        };
        let analysis_id = analysis
            .as_ref()
            .or(request.context.analysis.as_ref())
            .map(|a| a.analysis_id);

        let report = match analysis {
            Some(analysis) => {
                let mut request = request.clone();
                request.context.analysis = Some(analysis);
                self.engine.run(&request, cancel).await
            }
            None => self.engine.run(request, cancel).await,
        };
        let session_id = report.session_id;
        let attempts = report.outcome.attempts().to_vec();

        let result = match report.outcome {
            EngineOutcome::Success { mut attempts } => match attempts.pop() {
                Some(winner) => self.deploy(session_id, winner, attempts).await,
                None => SessionResult::Exhausted { attempts },
            },
            EngineOutcome::Exhausted { attempts } => SessionResult::Exhausted { attempts },
            EngineOutcome::GenerationFailed {
                attempt_number,
                error,
                attempts,
            } => SessionResult::GenerationFailed {
                attempt_number,
                error,
                attempts,
            },
            EngineOutcome::Cancelled { attempts } => SessionResult::Cancelled { attempts },
        };

        self.write_log(session_id, report.started_at, request, analysis_id, attempts, &result);

        tracing::info!(
            session_id = %session_id,
            status = result.status(),
            "Session finished: {}",
            result
        );
        (session_id, result)
    }

    /// Best effort: a failed or slow analysis never stops the session
    async fn analyze(
        &self,
        request: &ImprovementRequest,
        cancel: &CancellationToken,
    ) -> Option<FailureAnalysis> {
        let analyzer = self.analyzer.as_ref()?;
        let timeout = self.engine.config().generation_timeout;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = tokio::time::timeout(timeout, analyzer.analyze(&request.context)) => outcome,
        };

        let analysis = match outcome {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                tracing::warn!(analyzer = analyzer.name(), "Failure analysis failed: {}", e);
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    analyzer = analyzer.name(),
                    "Failure analysis timed out after {:?}",
                    timeout
                );
                return None;
            }
        };

        tracing::info!(
            analysis_id = %analysis.analysis_id,
            confidence = analysis.confidence_score,
            "Failure analyzed: {}",
            analysis.failure_reason
        );

        if let Some(log) = &self.analysis_log {
            if let Err(e) = log.append(&analysis) {
                tracing::warn!(path = %log.path().display(), "Failed to write analysis log: {}", e);
            }
        }
        Some(analysis)
    }

    fn write_log(
        &self,
        session_id: Uuid,
        started_at: DateTime<Utc>,
        request: &ImprovementRequest,
        analysis_id: Option<Uuid>,
        attempts: Vec<ImprovementAttempt>,
        result: &SessionResult,
    ) {
        let Some(log) = &self.log else { return };

        let entry = SessionLogEntry {
            session_id,
            status: result.status().to_string(),
            reason: request.context.reason.clone(),
            prediction_id: request.context.prediction_id,
            started_at,
            finished_at: Utc::now(),
            attempts,
            analysis_id,
            generation_error: match result {
                SessionResult::GenerationFailed { error, .. } => Some(error.clone()),
                _ => None,
            },
            deployment_id: match result {
                SessionResult::Deployed { record, .. } => Some(record.deployment_id),
                _ => None,
            },
            deployment_error: match result {
                SessionResult::DeploymentFailed { error, .. } => Some(error.to_string()),
                _ => None,
            },
        };

        if let Err(e) = log.append(&entry) {
            tracing::warn!(path = %log.path().display(), "Failed to write improvement log: {}", e);
        }
    }

    async fn deploy(
        &self,
        session_id: Uuid,
        winner: ImprovementAttempt,
        mut attempts: Vec<ImprovementAttempt>,
    ) -> SessionResult {
        let meta = DeploymentMeta {
            session_id: Some(session_id),
            description: winner.description.clone(),
        };

        match self.deployments.deploy(&winner.generated_code, meta) {
            Ok(record) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify(&record, &winner).await;
                }
                SessionResult::Deployed {
                    record,
                    attempt: winner,
                }
            }
            Err(error) => {
                tracing::error!(session_id = %session_id, "Deployment failed: {}", error);
                attempts.push(winner.clone());
                SessionResult::DeploymentFailed {
                    error,
                    attempt: winner,
                    attempts,
                }
            }
        }
    }
}
