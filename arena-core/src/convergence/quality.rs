//! Information gain of recent battles, measured as outcome surprise
//!
//! Level 2 - one of the three statistical signals

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::config::ConvergenceConfig;
use crate::types::{Battle, BattleId, ContextSnapshot, ItemId, Rating};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub average_surprise: f64,
    pub is_diminishing: bool,
    /// Mean surprise of the newest battles
    pub recent_quality: f64,
}

impl Default for QualityResult {
    fn default() -> Self {
        Self {
            average_surprise: 0.5,
            is_diminishing: false,
            recent_quality: 0.5,
        }
    }
}

/// Score the newest resolved battles against the ratings in force before each one.
pub fn analyze(snapshot: &ContextSnapshot, config: &ConvergenceConfig) -> QualityResult {
    let before = PreBattleRatings::index(snapshot);

    // Newest first
    let surprises: Vec<f64> = snapshot
        .battles
        .iter()
        .rev()
        .filter(|b| b.is_resolved())
        .filter_map(|b| surprise(b, &before, config.quality_logistic_scale))
        .take(config.quality_window)
        .collect();

    if surprises.len() < config.quality_min_battles {
        return QualityResult::default();
    }

    let half = config.quality_window / 2;
    let recent = mean(&surprises[..half.min(surprises.len())]);
    let previous = &surprises[half.min(surprises.len())..];
    let is_diminishing = !previous.is_empty() && recent < mean(previous) * config.diminishing_ratio;

    QualityResult {
        average_surprise: mean(&surprises),
        is_diminishing,
        recent_quality: recent,
    }
}

/// Expected score of A from an ordinal difference on a logistic curve
pub fn expected_score(diff: f64, scale: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-diff / scale))
}

fn surprise<'a>(battle: &'a Battle, before: &PreBattleRatings<'a>, scale: f64) -> Option<f64> {
    let actual = battle.outcome.score_for_a()?;
    let a = before.get(&battle.item_a, battle.id)?;
    let b = before.get(&battle.item_b, battle.id)?;
    Some((actual - expected_score(a.ordinal - b.ordinal, scale)).abs())
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// For each (item, battle), the rating that item carried into the battle.
struct PreBattleRatings<'a> {
    by_key: FxHashMap<(&'a ItemId, BattleId), &'a Rating>,
}

impl<'a> PreBattleRatings<'a> {
    fn index(snapshot: &'a ContextSnapshot) -> Self {
        let mut previous: FxHashMap<&'a ItemId, &'a Rating> = FxHashMap::default();
        let mut by_key = FxHashMap::default();

        for record in &snapshot.history {
            let item = &record.rating.item_id;
            if let (Some(battle_id), Some(prior)) = (record.battle_id, previous.get(item)) {
                by_key.insert((item, battle_id), *prior);
            }
            previous.insert(item, &record.rating);
        }

        Self { by_key }
    }

    fn get(&self, item: &'a ItemId, battle: BattleId) -> Option<&'a Rating> {
        self.by_key.get(&(item, battle)).copied()
    }
}
