//! Point-in-time view over every journal in the data directory.

use crate::config::Settings;
use crate::deployment::{DeploymentManager, DeploymentRecord, DeploymentStatus};
use crate::improvement::{
    AnalysisLog, AnalysisSummary, FailureAnalysis, ImprovementLog, PatternStore, SessionLogEntry,
};
use crate::models::PredictionRecord;
use crate::predictor::PredictionJournal;
use crate::Result;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionStats {
    pub total: usize,
    pub evaluated: usize,
    pub correct: usize,
    pub pending: usize,
    /// None until something has been evaluated
    pub accuracy: Option<f64>,
}

impl PredictionStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PredictionRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match &record.evaluation {
                Some(evaluation) => {
                    stats.evaluated += 1;
                    if evaluation.correct {
                        stats.correct += 1;
                    }
                }
                None => stats.pending += 1,
            }
        }
        if stats.evaluated > 0 {
            stats.accuracy = Some(stats.correct as f64 / stats.evaluated as f64);
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub live_deployment: Option<DeploymentRecord>,
    pub deployments: usize,
    pub rolled_back: usize,
    pub predictions: PredictionStats,
    /// Predictions made by the code that is live right now
    pub live_predictions: PredictionStats,
    pub patterns: usize,
    pub sessions: usize,
    pub deployed_sessions: usize,
    /// Newest first
    pub recent_sessions: Vec<SessionLogEntry>,
    pub analyses: AnalysisSummary,
}

impl SystemStatus {
    pub fn collect(
        history: &[DeploymentRecord],
        live_deployment: Option<DeploymentRecord>,
        predictions: &[PredictionRecord],
        patterns: usize,
        sessions: &[SessionLogEntry],
        analyses: &[FailureAnalysis],
        recent: usize,
    ) -> Self {
        let live_id: Option<Uuid> = live_deployment.as_ref().map(|r| r.deployment_id);

        Self {
            deployments: history.len(),
            rolled_back: history
                .iter()
                .filter(|r| r.status == DeploymentStatus::RolledBack)
                .count(),
            predictions: PredictionStats::from_records(predictions),
            live_predictions: PredictionStats::from_records(
                predictions.iter().filter(|p| p.deployment_id == live_id),
            ),
            live_deployment,
            patterns,
            sessions: sessions.len(),
            deployed_sessions: sessions.iter().filter(|s| s.status == "deployed").count(),
            recent_sessions: sessions.iter().rev().take(recent).cloned().collect(),
            analyses: AnalysisSummary::from_analyses(analyses),
        }
    }

    /// Read every journal under the configured data directory
    pub fn load(settings: &Settings, recent: usize) -> Result<Self> {
        let deployments = DeploymentManager::new(&settings.data_dir, settings.live_predictor_path());
        let history = deployments.history()?;
        let live = deployments.current()?;
        let predictions = PredictionJournal::new(settings.predictions_path()).all()?;
        let patterns = PatternStore::open(settings.patterns_path()).len();
        let sessions = ImprovementLog::new(settings.improvements_path()).entries()?;
        let analyses = AnalysisLog::new(settings.analyses_path()).entries()?;

        Ok(Self::collect(
            &history,
            live,
            &predictions,
            patterns,
            &sessions,
            &analyses,
            recent,
        ))
    }
}
