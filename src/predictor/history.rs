use crate::journal::{append_line, read_lines};
use crate::models::{Evaluation, PredictionRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Predictions and their evaluations in `predictions.jsonl`
///
/// Each state change appends the full record; the last line per id wins.
pub struct PredictionJournal {
    path: PathBuf,
}

impl PredictionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, prediction: &PredictionRecord) -> Result<()> {
        append_line(&self.path, prediction)?;
        tracing::debug!(id = %prediction.id, direction = %prediction.direction, "Recorded prediction");
        Ok(())
    }

    /// Latest state of every prediction, oldest first
    pub fn all(&self) -> Result<Vec<PredictionRecord>> {
        let lines: Vec<PredictionRecord> = read_lines(&self.path)?;

        let mut order = Vec::new();
        let mut latest: HashMap<Uuid, PredictionRecord> = HashMap::new();
        for record in lines {
            if !latest.contains_key(&record.id) {
                order.push(record.id);
            }
            latest.insert(record.id, record);
        }

        Ok(order.into_iter().filter_map(|id| latest.remove(&id)).collect())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<PredictionRecord>> {
        Ok(self.all()?.into_iter().find(|p| p.id == id))
    }

    /// Unevaluated predictions whose horizon has passed
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<PredictionRecord>> {
        Ok(self.all()?.into_iter().filter(|p| p.is_due(now)).collect())
    }

    /// Evaluate against the realized price. Already evaluated predictions are
    /// returned unchanged.
    pub fn evaluate(&self, id: Uuid, realized_price: f64) -> Result<PredictionRecord> {
        let mut prediction = self
            .get(id)?
            .ok_or_else(|| format!("Unknown prediction: {}", id))?;

        if prediction.evaluation.is_some() {
            return Ok(prediction);
        }
        if realized_price <= 0.0 {
            return Err(format!("Invalid realized price: {}", realized_price).into());
        }

        let evaluation = Evaluation::new(&prediction, realized_price);
        tracing::info!(
            id = %id,
            predicted = %prediction.direction,
            actual = %evaluation.actual_direction,
            correct = evaluation.correct,
            change_pct = %format!("{:+.2}", evaluation.price_change_pct),
            "Evaluated prediction"
        );

        prediction.evaluation = Some(evaluation);
        self.record(&prediction)?;
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::Duration;
    use tempfile::TempDir;

    fn prediction(direction: Direction, made_at: DateTime<Utc>) -> PredictionRecord {
        PredictionRecord {
            id: Uuid::new_v4(),
            direction,
            made_at,
            price_at_prediction: 60_000.0,
            horizon_hours: 24,
            data_points: 30,
            deployment_id: None,
            evaluation: None,
        }
    }

    #[test]
    fn test_due_respects_horizon() {
        let dir = TempDir::new().unwrap();
        let journal = PredictionJournal::new(dir.path().join("predictions.jsonl"));
        let now = Utc::now();

        let old = prediction(Direction::Up, now - Duration::hours(25));
        let fresh = prediction(Direction::Up, now - Duration::hours(2));
        journal.record(&old).unwrap();
        journal.record(&fresh).unwrap();

        let due = journal.due(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, old.id);
    }

    #[test]
    fn test_evaluate_wrong_prediction() {
        let dir = TempDir::new().unwrap();
        let journal = PredictionJournal::new(dir.path().join("predictions.jsonl"));
        let record = prediction(Direction::Up, Utc::now() - Duration::hours(30));
        journal.record(&record).unwrap();

        let evaluated = journal.evaluate(record.id, 58_800.0).unwrap();
        let evaluation = evaluated.evaluation.unwrap();

        assert_eq!(evaluation.actual_direction, Direction::Down);
        assert!(!evaluation.correct);
        assert!((evaluation.price_change_pct + 2.0).abs() < 1e-9);
        assert!(journal.due(Utc::now()).unwrap().is_empty());
        assert_eq!(journal.all().unwrap().len(), 1);
    }

    #[test]
    fn test_evaluate_twice_keeps_first_result() {
        let dir = TempDir::new().unwrap();
        let journal = PredictionJournal::new(dir.path().join("predictions.jsonl"));
        let record = prediction(Direction::Down, Utc::now() - Duration::hours(30));
        journal.record(&record).unwrap();

        let first = journal.evaluate(record.id, 59_000.0).unwrap();
        let second = journal.evaluate(record.id, 65_000.0).unwrap();
        assert_eq!(first.evaluation, second.evaluation);
    }

    #[test]
    fn test_unknown_prediction() {
        let dir = TempDir::new().unwrap();
        let journal = PredictionJournal::new(dir.path().join("predictions.jsonl"));
        assert!(journal.evaluate(Uuid::new_v4(), 1.0).is_err());
    }
}
