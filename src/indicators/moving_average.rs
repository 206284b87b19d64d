/// Simple moving average over the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential moving average, seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = sma(&values[..period], period)?;
    for value in &values[period..] {
        ema = (value - ema) * multiplier + ema;
    }

    Some(ema)
}

/// Fractional change between the last value and the one `lookback` steps earlier
pub fn momentum(values: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || values.len() <= lookback {
        return None;
    }

    let current = values[values.len() - 1];
    let past = values[values.len() - 1 - lookback];
    if past == 0.0 {
        return None;
    }

    Some((current - past) / past)
}

/// Ratio of the last two volumes to the two before them, overlapping by one
///
/// Matches the baseline predictor: sum(v[-2:]) / sum(v[-3:-1]).
pub fn volume_trend(volumes: &[f64]) -> Option<f64> {
    if volumes.len() < 3 {
        return None;
    }

    let n = volumes.len();
    let recent = volumes[n - 2] + volumes[n - 1];
    let previous = volumes[n - 3] + volumes[n - 2];
    if previous == 0.0 {
        return None;
    }

    Some(recent / previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_uses_most_recent_values() {
        let closes = vec![10.0, 100.0, 102.0, 104.0];
        assert_eq!(sma(&closes, 3), Some(102.0));
        assert_eq!(sma(&closes, 5), None);
        assert_eq!(sma(&closes, 0), None);
    }

    #[test]
    fn test_ema_tracks_rising_series() {
        let closes = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let value = ema(&closes, 5).unwrap();
        assert!(value > 104.0 && value < 110.0);
    }

    #[test]
    fn test_momentum() {
        let closes = vec![100.0, 101.0, 102.0, 103.0, 104.0, 110.0];
        assert!((momentum(&closes, 5).unwrap() - 0.10).abs() < 1e-9);
        assert_eq!(momentum(&closes, 6), None);
    }

    #[test]
    fn test_volume_trend() {
        let volumes = vec![100.0, 100.0, 200.0];
        assert!((volume_trend(&volumes).unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(volume_trend(&volumes[..2]), None);
    }
}
