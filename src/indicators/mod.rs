// Technical indicators used to describe market context for failed predictions

pub mod moving_average;

pub use moving_average::{ema, momentum, sma, volume_trend};

use crate::models::Candle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Indicator snapshot at the time of a prediction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketIndicators {
    pub last_close: f64,
    pub sma_3: Option<f64>,
    pub sma_5: Option<f64>,
    pub ema_5: Option<f64>,
    pub momentum_5: Option<f64>,
    pub volume_trend: Option<f64>,
}

impl MarketIndicators {
    /// Returns None for an empty series
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let last = candles.last()?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        Some(Self {
            last_close: last.close,
            sma_3: sma(&closes, 3),
            sma_5: sma(&closes, 5),
            ema_5: ema(&closes, 5),
            momentum_5: momentum(&closes, 4),
            volume_trend: volume_trend(&volumes),
        })
    }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "n/a".to_string(),
    }
}

impl fmt::Display for MarketIndicators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "- Last close: ${:.2}", self.last_close)?;
        writeln!(f, "- SMA(3): {}", fmt_opt(self.sma_3, 2))?;
        writeln!(f, "- SMA(5): {}", fmt_opt(self.sma_5, 2))?;
        writeln!(f, "- EMA(5): {}", fmt_opt(self.ema_5, 2))?;
        writeln!(
            f,
            "- Momentum (5 days): {}",
            fmt_opt(self.momentum_5.map(|m| m * 100.0), 2) + "%"
        )?;
        write!(f, "- Volume trend: {}", fmt_opt(self.volume_trend, 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::days(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                token: "BTC".to_string(),
                timestamp: start + Duration::days(i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1_000.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn test_indicators_from_short_series() {
        let indicators = MarketIndicators::from_candles(&make_candles(&[100.0, 101.0])).unwrap();
        assert_eq!(indicators.last_close, 101.0);
        assert!(indicators.sma_3.is_none());
        assert!(indicators.to_string().contains("SMA(3): n/a"));
    }

    #[test]
    fn test_indicators_empty_series() {
        assert!(MarketIndicators::from_candles(&[]).is_none());
    }

    #[test]
    fn test_momentum_spans_five_closes() {
        let indicators =
            MarketIndicators::from_candles(&make_candles(&[90.0, 100.0, 101.0, 102.0, 103.0, 110.0]))
                .unwrap();
        assert!((indicators.momentum_5.unwrap() - 0.10).abs() < 1e-9);
    }
}
