//! Sigma trend over wall-clock time
//!
//! Level 2 - one of the three statistical signals

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::ConvergenceConfig;
use crate::types::RatingRecord;

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    #[default]
    Stable,
    Degrading,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    /// Sigma drop per hour (negated regression slope)
    pub convergence_rate: f64,
    /// Forecast of remaining battles, when the trend allows one
    pub predicted_battles: Option<f64>,
    pub is_converging: bool,
    pub direction: TrendDirection,
}

/// Fit the sampled sigma history against time.
///
/// `history` must be chronological.
pub fn analyze(history: &[RatingRecord], config: &ConvergenceConfig) -> TrendResult {
    let buckets = hourly_buckets(history, config);
    if buckets.len() < 3 {
        return TrendResult::default();
    }

    let slope = regression_slope(&buckets);
    let rate = -slope;
    let is_converging = rate > config.trend_min_rate;

    let current_sigma = buckets.last().map_or(0.0, |&(_, sigma)| sigma);
    let predicted_battles = if is_converging && current_sigma > config.trend_target_sigma {
        Some(((current_sigma - config.trend_target_sigma) / rate * 10.0).max(0.0))
    } else {
        None
    };

    let tail = buckets.len().saturating_sub(config.trend_direction_points);
    let direction = trend_direction(&buckets[tail..], config.trend_direction_threshold);

    TrendResult {
        convergence_rate: rate,
        predicted_battles,
        is_converging,
        direction,
    }
}

/// Average sigma of every Nth record (counted from the newest), grouped by
/// hour. Returns the newest buckets in chronological order as
/// `(hours since first bucket, avg sigma)`.
fn hourly_buckets(history: &[RatingRecord], config: &ConvergenceConfig) -> Vec<(f64, f64)> {
    let step = config.trend_sample_every.max(1);
    let mut by_hour: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for record in history.iter().rev().step_by(step) {
        let hour = record.recorded_at().timestamp().div_euclid(SECONDS_PER_HOUR);
        let entry = by_hour.entry(hour).or_insert((0.0, 0));
        entry.0 += record.rating.sigma;
        entry.1 += 1;
    }

    let skip = by_hour.len().saturating_sub(config.trend_max_buckets);
    let kept: Vec<(i64, f64)> = by_hour
        .into_iter()
        .skip(skip)
        .map(|(hour, (sum, n))| (hour, sum / n as f64))
        .collect();

    let origin = kept.first().map_or(0, |&(hour, _)| hour);
    kept.into_iter().map(|(hour, sigma)| ((hour - origin) as f64, sigma)).collect()
}

/// Ordinary least squares slope of y on x
fn regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for &(x, y) in points {
        covariance += (x - mean_x) * (y - mean_y);
        variance += (x - mean_x) * (x - mean_x);
    }

    if variance == 0.0 {
        0.0
    } else {
        covariance / variance
    }
}

/// Mean step between consecutive chronological points
fn trend_direction(points: &[(f64, f64)], threshold: f64) -> TrendDirection {
    if points.len() < 3 {
        return TrendDirection::Stable;
    }

    let changes: Vec<f64> = points.windows(2).map(|w| w[1].1 - w[0].1).collect();
    let mean_change = changes.iter().sum::<f64>() / changes.len() as f64;

    if mean_change < -threshold {
        TrendDirection::Improving
    } else if mean_change > threshold {
        TrendDirection::Degrading
    } else {
        TrendDirection::Stable
    }
}
