//! Convergence detection - decide when a context has seen enough battles
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: ConvergenceDetector::should_stop (orchestration, smoothing)
//! - Level 2: practical_decision / statistical_decision, plus the stability,
//!   trend and quality signals
//! - Level 3: window rankings, hourly buckets, surprise scores
//! - Level 4: ConvergenceConfig, ProgressSmoother
//!
//! Everything except the progress smoother is a pure function of the
//! snapshot passed in.

mod config;
mod decision;
mod progress;
pub mod quality;
pub mod stability;
pub mod trend;

pub use config::{ConvergenceConfig, PracticalTier};
pub use decision::{ConvergenceDecision, DetectionMode};
pub use progress::ProgressSmoother;
pub use quality::QualityResult;
pub use stability::{ranking_similarity, StabilityResult, WindowSummary};
pub use trend::{TrendDirection, TrendResult};

use crate::error::ConvergenceError;
use crate::types::{ContextId, ContextSnapshot};

/// Key used for snapshots that carry no context id
const ANONYMOUS_CONTEXT: &str = "_";

/// Stop/continue oracle, holding only the per-context progress smoothing
#[derive(Clone, Debug)]
pub struct ConvergenceDetector {
    config: ConvergenceConfig,
    progress: ProgressSmoother,
}

impl Default for ConvergenceDetector {
    fn default() -> Self {
        Self::new(ConvergenceConfig::default())
    }
}

impl ConvergenceDetector {
    pub fn new(config: ConvergenceConfig) -> Self {
        let progress = ProgressSmoother::new(config.max_progress_step);
        Self { config, progress }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    // ========================================================================
    // Level 1 - Orchestration
    // ========================================================================

    /// Decide whether the context in `snapshot` should stop.
    ///
    /// Never fails: a snapshot that cannot be judged yields
    /// `should_stop = false` with zero confidence.
    pub fn should_stop(&mut self, snapshot: &ContextSnapshot) -> ConvergenceDecision {
        let context = snapshot
            .context_id
            .clone()
            .unwrap_or_else(|| ContextId::new(ANONYMOUS_CONTEXT));

        let mut decision = match self.assess(snapshot) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("Convergence check for {} failed: {}", context, e);
                let mut fallback = ConvergenceDecision::fallback(format!("Error in convergence detection: {}", e));
                fallback.progress = self.progress.last(&context).unwrap_or(0.0);
                return fallback;
            }
        };

        if decision.should_stop {
            decision.progress = 100.0;
            self.progress.reset(&context);
        } else {
            decision.progress = self.progress.smooth(&context, decision.progress);
        }

        tracing::debug!(
            "Convergence {} ({:?}): stop={} confidence={:.2} progress={:.1} - {}",
            context,
            decision.mode,
            decision.should_stop,
            decision.confidence,
            decision.progress,
            decision.reason
        );
        decision
    }

    /// Unsmoothed decision for a snapshot
    pub fn assess(&self, snapshot: &ContextSnapshot) -> Result<ConvergenceDecision, ConvergenceError> {
        validate(snapshot)?;

        if snapshot.item_count() < self.config.statistical_threshold {
            return Ok(decision::practical_decision(snapshot, &self.config));
        }

        let stability = stability::analyze(snapshot, &self.config);
        let trend = trend::analyze(&snapshot.history, &self.config);
        let quality = quality::analyze(snapshot, &self.config);
        Ok(decision::statistical_decision(snapshot, stability, trend, quality, &self.config))
    }
}

fn validate(snapshot: &ContextSnapshot) -> Result<(), ConvergenceError> {
    if snapshot.item_count() < 2 {
        return Err(ConvergenceError::InsufficientItems(snapshot.item_count()));
    }
    if let Some(bad) = snapshot.ratings.iter().find(|r| !r.is_finite()) {
        return Err(ConvergenceError::NonFiniteRating(bad.item_id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ordinal, ItemId, Rating};
    use chrono::Utc;

    fn snapshot(context: &str, n: usize, sigma: f64, battles: u32, total: usize) -> ContextSnapshot {
        let ratings = (0..n)
            .map(|i| Rating {
                item_id: ItemId::new(format!("item-{i:03}")),
                context_id: ContextId::from(context),
                mu: 25.0,
                sigma,
                ordinal: ordinal(25.0, sigma),
                battle_count: battles,
                updated_at: Utc::now(),
            })
            .collect();
        ContextSnapshot {
            context_id: Some(ContextId::from(context)),
            ratings,
            total_battles: total,
            ..Default::default()
        }
    }

    #[test]
    fn test_practical_sequence_for_thirty_items() {
        let mut detector = ConvergenceDetector::default();
        let steps = [(8.5, 2, 30), (7.5, 4, 60), (6.9, 5, 75)];
        let stops: Vec<bool> = steps
            .iter()
            .map(|&(sigma, battles, total)| detector.should_stop(&snapshot("ctx", 30, sigma, battles, total)).should_stop)
            .collect();
        assert_eq!(stops, vec![false, false, true]);

        // Further battles only lower sigma; the decision holds.
        let later = detector.should_stop(&snapshot("ctx", 30, 6.5, 6, 90));
        assert!(later.should_stop);
    }

    #[test]
    fn test_single_item_is_default_decision() {
        let mut detector = ConvergenceDetector::default();
        let decision = detector.should_stop(&snapshot("ctx", 1, 5.0, 10, 10));
        assert!(!decision.should_stop);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.mode, DetectionMode::Fallback);
    }

    #[test]
    fn test_non_finite_rating_is_default_decision() {
        let mut detector = ConvergenceDetector::default();
        let mut snap = snapshot("ctx", 5, 5.0, 10, 10);
        snap.ratings[2].sigma = f64::NAN;
        let decision = detector.should_stop(&snap);
        assert!(!decision.should_stop);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reason.contains("item-002"));
    }

    #[test]
    fn test_progress_moves_at_most_fifteen_points() {
        let mut detector = ConvergenceDetector::default();
        let first = detector.should_stop(&snapshot("ctx", 30, 8.3, 0, 0)).progress;
        // coverage jumps from 0 to 100 percent in one step
        let second = detector.should_stop(&snapshot("ctx", 30, 8.3, 5, 75)).progress;
        assert!(second - first <= 15.0 + 1e-9);
        assert!(second > first);
    }

    #[test]
    fn test_stop_reports_full_progress_and_resets() {
        let mut detector = ConvergenceDetector::default();
        detector.should_stop(&snapshot("ctx", 30, 8.3, 0, 0));
        let stop = detector.should_stop(&snapshot("ctx", 30, 6.0, 5, 75));
        assert!(stop.should_stop);
        assert_eq!(stop.progress, 100.0);
        assert_eq!(detector.progress.last(&ContextId::from("ctx")), None);
    }

    #[test]
    fn test_statistical_mode_for_large_pools() {
        let detector = ConvergenceDetector::new(ConvergenceConfig::default().with_statistical_threshold(20));
        let decision = detector.assess(&snapshot("ctx", 20, 8.0, 1, 20)).unwrap();
        assert_eq!(decision.mode, DetectionMode::Statistical);
        assert!(!decision.should_stop);
    }
}
