//! Configuration for convergence detection
//!
//! Level 4 - Utilities and configuration

use serde::{Deserialize, Serialize};

use crate::rating::DEFAULT_SIGMA;

/// Practical thresholds for one pool-size band
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PracticalTier {
    /// Pools with fewer items than this use the tier
    pub below: usize,
    pub target_sigma: f64,
    pub min_battles: u32,
}

/// Thresholds for both detection modes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Pools of at least this many items use statistical detection
    pub statistical_threshold: usize,
    /// Tiers checked in order; the last tier catches every remaining pool size
    pub practical_tiers: Vec<PracticalTier>,
    /// Extra battles per item allowed before the efficiency exit
    pub efficiency_slack: u32,

    /// Stability needs at least this many resolved battles
    pub stability_min_battles: usize,
    pub stability_max_windows: usize,
    pub window_size_small: usize,
    pub window_size_large: usize,
    /// Similarity above which two consecutive windows count as stable
    pub stable_similarity: f64,

    /// Every Nth rating record is sampled for the sigma trend
    pub trend_sample_every: usize,
    pub trend_max_buckets: usize,
    pub trend_min_rate: f64,
    /// Sigma the trend forecast counts down to
    pub trend_target_sigma: f64,
    pub trend_direction_points: usize,
    pub trend_direction_threshold: f64,

    pub quality_window: usize,
    pub quality_min_battles: usize,
    /// Rating difference scale of the expected-score logistic
    pub quality_logistic_scale: f64,
    pub diminishing_ratio: f64,

    /// Hard stop at this many battles per item
    pub hard_limit_per_item: f64,
    pub soft_limit_per_item: f64,
    pub soft_limit_sigma: f64,
    pub sigma_rule_sigma: f64,
    pub sigma_rule_battles_per_item: f64,

    /// Largest movement of the reported progress between two calls
    pub max_progress_step: f64,
    /// Sigma of a freshly seeded item, the zero point of sigma progress
    pub initial_sigma: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            statistical_threshold: 500,
            practical_tiers: vec![
                PracticalTier {
                    below: 50,
                    target_sigma: 7.0,
                    min_battles: 5,
                },
                PracticalTier {
                    below: 200,
                    target_sigma: 6.5,
                    min_battles: 4,
                },
                PracticalTier {
                    below: usize::MAX,
                    target_sigma: 6.0,
                    min_battles: 3,
                },
            ],
            efficiency_slack: 2,

            stability_min_battles: 100,
            stability_max_windows: 6,
            window_size_small: 10,
            window_size_large: 20,
            stable_similarity: 0.75,

            trend_sample_every: 100,
            trend_max_buckets: 20,
            trend_min_rate: 0.001,
            trend_target_sigma: 2.5,
            trend_direction_points: 5,
            trend_direction_threshold: 0.1,

            quality_window: 20,
            quality_min_battles: 10,
            quality_logistic_scale: 400.0,
            diminishing_ratio: 0.8,

            hard_limit_per_item: 6.0,
            soft_limit_per_item: 3.0,
            soft_limit_sigma: 7.5,
            sigma_rule_sigma: 7.0,
            sigma_rule_battles_per_item: 2.0,

            max_progress_step: 15.0,
            initial_sigma: DEFAULT_SIGMA,
        }
    }
}

impl ConvergenceConfig {
    /// Set the pool size at which statistical detection takes over
    pub fn with_statistical_threshold(mut self, items: usize) -> Self {
        self.statistical_threshold = items;
        self
    }

    /// Replace the practical tiers
    pub fn with_practical_tiers(mut self, tiers: Vec<PracticalTier>) -> Self {
        self.practical_tiers = tiers;
        self
    }

    /// Set the progress smoothing step
    pub fn with_max_progress_step(mut self, step: f64) -> Self {
        self.max_progress_step = step;
        self
    }

    /// Thresholds for a practical pool of `items` items
    pub fn tier_for(&self, items: usize) -> PracticalTier {
        self.practical_tiers
            .iter()
            .copied()
            .find(|t| items < t.below)
            .or_else(|| self.practical_tiers.last().copied())
            .unwrap_or(PracticalTier {
                below: usize::MAX,
                target_sigma: 6.0,
                min_battles: 3,
            })
    }

    pub fn window_size(&self, items: usize) -> usize {
        if items >= self.statistical_threshold {
            self.window_size_large
        } else {
            self.window_size_small
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_by_pool_size() {
        let config = ConvergenceConfig::default();
        assert_eq!(config.tier_for(30).min_battles, 5);
        assert_eq!(config.tier_for(50).target_sigma, 6.5);
        assert_eq!(config.tier_for(199).min_battles, 4);
        assert_eq!(config.tier_for(499).target_sigma, 6.0);
    }

    #[test]
    fn test_empty_tiers_fall_back() {
        let config = ConvergenceConfig::default().with_practical_tiers(vec![]);
        assert_eq!(config.tier_for(10).min_battles, 3);
    }
}
