use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Daily OHLCV candle for an asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub token: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Shape handed to the Python predictor: one dict per day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for PricePoint {
    fn from(candle: &Candle) -> Self {
        Self {
            date: candle.timestamp.format("%Y-%m-%d").to_string(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

/// Predicted or realized price direction over the horizon
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Realized direction between two prices (flat counts as down)
    pub fn between(old_price: f64, new_price: f64) -> Self {
        if new_price > old_price {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("invalid label '{}', expected one of: up, down", other)),
        }
    }
}

/// A prediction made by the live predictor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub direction: Direction,
    pub made_at: DateTime<Utc>,
    pub price_at_prediction: f64,
    pub horizon_hours: u32,
    pub data_points: usize,
    /// Deployment that was live when the prediction was made (None = baseline)
    pub deployment_id: Option<Uuid>,
    pub evaluation: Option<Evaluation>,
}

impl PredictionRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.evaluation.is_none()
            && now - self.made_at >= chrono::Duration::hours(self.horizon_hours as i64)
    }
}

/// Outcome of checking a prediction against the realized price
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub realized_price: f64,
    pub actual_direction: Direction,
    pub correct: bool,
    pub price_change_pct: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(prediction: &PredictionRecord, realized_price: f64) -> Self {
        let actual_direction = Direction::between(prediction.price_at_prediction, realized_price);
        let price_change_pct = if prediction.price_at_prediction > 0.0 {
            (realized_price - prediction.price_at_prediction) / prediction.price_at_prediction
                * 100.0
        } else {
            0.0
        };

        Self {
            realized_price,
            actual_direction,
            correct: actual_direction == prediction.direction,
            price_change_pct,
            evaluated_at: Utc::now(),
        }
    }
}
