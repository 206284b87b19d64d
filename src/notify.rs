// Hooks run after a validated improvement went live

use crate::deployment::DeploymentRecord;
use crate::improvement::ImprovementAttempt;
use async_trait::async_trait;

/// Told about every successful deployment. Failures here never undo a deploy.
#[async_trait]
pub trait DeploymentNotifier: Send + Sync {
    async fn notify(&self, record: &DeploymentRecord, attempt: &ImprovementAttempt);
}

/// Emits one structured tracing event per deployment
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl DeploymentNotifier for LogNotifier {
    async fn notify(&self, record: &DeploymentRecord, attempt: &ImprovementAttempt) {
        tracing::info!(
            deployment_id = %record.deployment_id,
            session_id = ?record.session_id,
            attempt = attempt.attempt_number,
            strategy = %attempt.focus_strategy,
            backup = %record.backup_path,
            release = %record.deployed_code_ref,
            changes = attempt.changes_made.len(),
            "🚀 Improved predictor is live: {}",
            attempt.description.as_deref().unwrap_or("no description")
        );
    }
}
