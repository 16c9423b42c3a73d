//! Stop/continue decisions for both detection modes
//!
//! Level 2 - phases: practical_decision, statistical_decision

use serde::{Deserialize, Serialize};

use super::config::{ConvergenceConfig, PracticalTier};
use super::quality::QualityResult;
use super::stability::StabilityResult;
use super::trend::{TrendDirection, TrendResult};
use crate::types::ContextSnapshot;

/// Which rule set produced a decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Sigma and battle-count thresholds for small and mid-sized pools
    Practical,
    /// Stability, trend and quality signals for large pools
    Statistical,
    /// Detection could not run; the decision is the conservative default
    Fallback,
}

/// Outcome of one convergence check
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceDecision {
    pub should_stop: bool,
    pub reason: String,
    /// Confidence in `should_stop`, in [0, 1]
    pub confidence: f64,
    /// Completion estimate in percent, smoothed per context
    pub progress: f64,
    pub mode: DetectionMode,
    pub stability: StabilityResult,
    pub trend: TrendResult,
    pub quality: QualityResult,
    pub avg_sigma: f64,
    pub min_battles: u32,
    pub total_battles: usize,
}

impl ConvergenceDecision {
    /// Continue with zero confidence, used when detection fails
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            should_stop: false,
            reason: reason.into(),
            confidence: 0.0,
            progress: 0.0,
            mode: DetectionMode::Fallback,
            stability: StabilityResult::default(),
            trend: TrendResult::default(),
            quality: QualityResult {
                average_surprise: 0.0,
                is_diminishing: false,
                recent_quality: 0.0,
            },
            avg_sigma: 0.0,
            min_battles: 0,
            total_battles: 0,
        }
    }
}

// ============================================================================
// Practical mode
// ============================================================================

/// Threshold rules for pools below the statistical threshold
pub fn practical_decision(snapshot: &ContextSnapshot, config: &ConvergenceConfig) -> ConvergenceDecision {
    let items = snapshot.item_count();
    let tier = config.tier_for(items);
    let avg_sigma = snapshot.average_sigma();
    let min_battles = snapshot.min_battle_count();
    let total = snapshot.total_battles;

    let sigma_converged = avg_sigma < tier.target_sigma;
    let battles_reached = min_battles >= tier.min_battles;
    let expected_max = items * (tier.min_battles + config.efficiency_slack) as usize;

    let (should_stop, confidence, reason) = if sigma_converged && battles_reached {
        let reason = format!(
            "Practical convergence: avgSigma={:.2}<{}, minBattles={}≥{}",
            avg_sigma, tier.target_sigma, min_battles, tier.min_battles
        );
        (true, 0.9, reason)
    } else if total > expected_max {
        let reason = format!(
            "Efficiency exit: {} battles exceeds expected {} ({:.1} per item)",
            total,
            expected_max,
            total as f64 / items as f64
        );
        (true, 0.8, reason)
    } else {
        let mut issues = Vec::new();
        if !sigma_converged {
            issues.push(format!("avgSigma={:.2}≥{}", avg_sigma, tier.target_sigma));
        }
        if !battles_reached {
            issues.push(format!("minBattles={}<{}", min_battles, tier.min_battles));
        }
        (false, 0.8, format!("Practical continuing: {}", issues.join(", ")))
    };

    // Practical mode has no window analysis; the signals summarise the thresholds.
    let stability = StabilityResult {
        is_stable: should_stop,
        score: if sigma_converged { 0.9 } else { 0.5 },
        consecutive_stable_windows: if should_stop { 5 } else { 0 },
        windows: Vec::new(),
    };
    let trend = TrendResult {
        convergence_rate: if sigma_converged { 1.0 } else { 0.0 },
        predicted_battles: if should_stop {
            Some(0.0)
        } else {
            Some(expected_max.saturating_sub(total) as f64)
        },
        is_converging: avg_sigma < 8.0,
        direction: if sigma_converged {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        },
    };
    let quality = QualityResult {
        average_surprise: 0.4,
        is_diminishing: battles_reached,
        recent_quality: if battles_reached { 0.8 } else { 0.5 },
    };

    ConvergenceDecision {
        should_stop,
        reason,
        confidence,
        progress: practical_progress(snapshot, tier, config),
        mode: DetectionMode::Practical,
        stability,
        trend,
        quality,
        avg_sigma,
        min_battles,
        total_battles: total,
    }
}

// ============================================================================
// Statistical mode
// ============================================================================

/// Efficiency limits first, then the combined signals
pub fn statistical_decision(
    snapshot: &ContextSnapshot,
    stability: StabilityResult,
    trend: TrendResult,
    quality: QualityResult,
    config: &ConvergenceConfig,
) -> ConvergenceDecision {
    let items = snapshot.item_count() as f64;
    let avg_sigma = snapshot.average_sigma();
    let total = snapshot.total_battles;
    let per_item = total as f64 / items;

    let limit_stop = if total as f64 >= items * config.hard_limit_per_item {
        Some((0.8, format!("Hard efficiency limit: {} battles ({:.1} per item)", total, per_item)))
    } else if total as f64 >= items * config.soft_limit_per_item && avg_sigma < config.soft_limit_sigma {
        Some((
            0.7,
            format!(
                "Soft efficiency limit with reasonable sigma: {:.2} ({:.1} per item)",
                avg_sigma, per_item
            ),
        ))
    } else if avg_sigma < config.sigma_rule_sigma && per_item >= config.sigma_rule_battles_per_item {
        Some((
            0.6,
            format!("Sigma convergence: avgSigma={:.2}, {:.1} battles per item", avg_sigma, per_item),
        ))
    } else {
        None
    };

    let signal_stop = || {
        if stability.score > 0.4 && stability.consecutive_stable_windows >= 1 {
            Some((
                0.6,
                format!(
                    "Relaxed ranking stability: {:.1}% stability, {} stable windows",
                    stability.score * 100.0,
                    stability.consecutive_stable_windows
                ),
            ))
        } else if quality.is_diminishing && stability.score > 0.3 {
            Some((0.5, "Information gain diminishing with minimal stability".to_string()))
        } else if trend.is_converging && trend.direction == TrendDirection::Improving && stability.score > 0.3 {
            Some((0.5, "Sigma convergence with improving trend and minimal stability".to_string()))
        } else if stability.score > 0.7 && stability.windows.len() >= 2 {
            Some((0.6, "Good ranking stability detected".to_string()))
        } else {
            None
        }
    };

    let (should_stop, confidence, reason) = match limit_stop.or_else(signal_stop) {
        Some((confidence, reason)) => (true, confidence, reason),
        None => {
            let confidence = match stability.windows.len() {
                n if n >= 3 => (0.3 + stability.score * 0.5).min(0.8),
                n if n >= 1 => 0.6,
                _ => 0.7,
            };
            let reason = format!(
                "Continuing evaluation: stability={:.1}%, consecutive={}, trend={:?}",
                stability.score * 100.0,
                stability.consecutive_stable_windows,
                trend.direction
            );
            (false, confidence, reason)
        }
    };

    ConvergenceDecision {
        should_stop,
        reason,
        confidence,
        progress: statistical_progress(snapshot, config),
        mode: DetectionMode::Statistical,
        stability,
        trend,
        quality,
        avg_sigma,
        min_battles: snapshot.min_battle_count(),
        total_battles: total,
    }
}

// ============================================================================
// Level 3 - Progress estimates
// ============================================================================

fn sigma_progress(avg_sigma: f64, target: f64, config: &ConvergenceConfig) -> f64 {
    let span = config.initial_sigma - target;
    if span <= 0.0 {
        return 100.0;
    }
    ((config.initial_sigma - avg_sigma) / span * 100.0).clamp(0.0, 100.0)
}

/// Weighted mix of battle coverage and sigma reduction
fn practical_progress(snapshot: &ContextSnapshot, tier: PracticalTier, config: &ConvergenceConfig) -> f64 {
    let items = snapshot.item_count().max(1) as f64;
    let covered = snapshot
        .ratings
        .iter()
        .filter(|r| r.battle_count >= tier.min_battles)
        .count() as f64;
    let coverage = (covered / items * 100.0).clamp(0.0, 100.0);
    let sigma = sigma_progress(snapshot.average_sigma(), tier.target_sigma, config);
    0.7 * coverage + 0.3 * sigma
}

/// The further along of the hard battle limit and the sigma rule
fn statistical_progress(snapshot: &ContextSnapshot, config: &ConvergenceConfig) -> f64 {
    let limit = snapshot.item_count() as f64 * config.hard_limit_per_item;
    let battles = if limit > 0.0 {
        (snapshot.total_battles as f64 / limit * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    battles.max(sigma_progress(snapshot.average_sigma(), config.sigma_rule_sigma, config))
}
