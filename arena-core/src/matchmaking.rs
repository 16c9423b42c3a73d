//! Matchmaking - pick the next most informative comparison
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: select_next_pair (orchestration)
//! - Level 2: pick_priority, score_window, fallback_pair (phases)
//! - Level 3: bucketing, exclusion set, pair scoring (steps)
//! - Level 4: MatchmakingConfig
//!
//! The selector is a pure function of the snapshot it is given: the same
//! candidates and history always produce the same pair.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::types::{Battle, ItemId, Rating};

// ============================================================================
// Level 4 - Configuration
// ============================================================================

/// Tuning for pair selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Pools strictly larger than this use the "large" bucket settings
    pub large_pool_threshold: usize,
    pub bucket_width_large: f64,
    pub bucket_width_small: f64,
    /// Search radius in buckets around the priority candidate
    pub window_large: i64,
    pub window_small: i64,
    /// How many recent resolved battles block an immediate rematch
    pub freshness_battles: usize,
    /// Ordinal distance scale of the Gaussian closeness term
    pub rating_scale: f64,
    /// Sigma at which the uncertainty term saturates
    pub sigma_reference: f64,
    /// Battle count scale of the balance term
    pub balance_scale: f64,
    pub rating_weight: f64,
    pub sigma_weight: f64,
    pub balance_weight: f64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            large_pool_threshold: 100,
            bucket_width_large: 10.0,
            bucket_width_small: 25.0,
            window_large: 3,
            window_small: 2,
            freshness_battles: 100,
            rating_scale: 15.0,
            sigma_reference: 8.33,
            balance_scale: 10.0,
            rating_weight: 0.6,
            sigma_weight: 0.3,
            balance_weight: 0.1,
        }
    }
}

impl MatchmakingConfig {
    fn is_large(&self, pool_size: usize) -> bool {
        pool_size > self.large_pool_threshold
    }

    fn bucket_width(&self, pool_size: usize) -> f64 {
        if self.is_large(pool_size) {
            self.bucket_width_large
        } else {
            self.bucket_width_small
        }
    }

    fn window(&self, pool_size: usize) -> i64 {
        if self.is_large(pool_size) {
            self.window_large
        } else {
            self.window_small
        }
    }
}

/// Where a selected pair came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Best-scoring opponent inside the priority candidate's window
    Scored,
    /// Least-battled pair, used when the window had no eligible opponent
    Fallback,
}

/// A selected pair. `item_a` is always the priority candidate when scored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub score: f64,
    pub source: SelectionSource,
}

// ============================================================================
// Level 1 - Orchestration
// ============================================================================

/// Pick the next pair to compare with the default configuration.
pub fn select_next_pair(candidates: &[Rating], recent_history: &[Battle]) -> Option<Selection> {
    Matchmaker::default().select_next_pair(candidates, recent_history)
}

/// Pair selector with its configuration
#[derive(Clone, Debug, Default)]
pub struct Matchmaker {
    config: MatchmakingConfig,
}

impl Matchmaker {
    pub fn new(config: MatchmakingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Returns `None` only when fewer than two live candidates exist.
    pub fn select_next_pair(&self, candidates: &[Rating], recent_history: &[Battle]) -> Option<Selection> {
        let pool = live_candidates(candidates);
        if pool.len() < 2 {
            return None;
        }

        let recent = recent_resolved(recent_history, self.config.freshness_battles);
        let priority = pick_priority(&pool);

        if let Some(selection) = self.score_window(&pool, priority, &recent) {
            return Some(selection);
        }

        tracing::debug!(
            "No eligible opponent near {} (sigma {:.2}), using fallback pair",
            priority.item_id,
            priority.sigma
        );
        Some(fallback_pair(&pool, &recent))
    }

    // ========================================================================
    // Level 2 - Phases
    // ========================================================================

    /// Score every eligible opponent inside the bucket window around `priority`
    fn score_window(&self, pool: &[&Rating], priority: &Rating, recent: &[&Battle]) -> Option<Selection> {
        let width = self.config.bucket_width(pool.len());
        let window = self.config.window(pool.len());
        let home = bucket_of(priority.ordinal, width);
        let blocked = recent_opponents(recent, &priority.item_id);

        let mut best: Option<(&Rating, f64)> = None;
        for &opponent in pool {
            if opponent.item_id == priority.item_id || blocked.contains(&opponent.item_id) {
                continue;
            }
            if (bucket_of(opponent.ordinal, width) - home).abs() > window {
                continue;
            }

            let score = self.pair_score(priority, opponent);
            // Pool is sorted by item id, so strict comparison keeps the lowest id on ties.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((opponent, score));
            }
        }

        best.map(|(opponent, score)| Selection {
            item_a: priority.item_id.clone(),
            item_b: opponent.item_id.clone(),
            score,
            source: SelectionSource::Scored,
        })
    }

    // ========================================================================
    // Level 3 - Steps
    // ========================================================================

    /// Composite desirability of comparing `a` with `b`
    pub fn pair_score(&self, a: &Rating, b: &Rating) -> f64 {
        let c = &self.config;

        let distance = (a.ordinal - b.ordinal) / c.rating_scale;
        let rating_score = (-(distance * distance)).exp();

        let avg_sigma = (a.sigma + b.sigma) / 2.0;
        let sigma_score = (avg_sigma / c.sigma_reference).min(1.0) * 0.8;

        let avg_battles = (a.battle_count as f64 + b.battle_count as f64) / 2.0;
        let balance_score = (-avg_battles / c.balance_scale).exp() * 0.6;

        c.rating_weight * rating_score + c.sigma_weight * sigma_score + c.balance_weight * balance_score
    }
}

/// Highest sigma first, then fewest battles, then lowest id
fn pick_priority<'a>(pool: &[&'a Rating]) -> &'a Rating {
    let mut best = pool[0];
    for &r in &pool[1..] {
        let more_uncertain = r.sigma > best.sigma;
        let same_sigma_fewer_battles = r.sigma == best.sigma && r.battle_count < best.battle_count;
        if more_uncertain || same_sigma_fewer_battles {
            best = r;
        }
    }
    best
}

/// Least-battled pair that is not a recent rematch; if every pair is a
/// recent rematch, the two least-battled items.
fn fallback_pair(pool: &[&Rating], recent: &[&Battle]) -> Selection {
    let mut by_battles: Vec<&Rating> = pool.to_vec();
    by_battles.sort_by(|a, b| a.battle_count.cmp(&b.battle_count).then_with(|| a.item_id.cmp(&b.item_id)));

    let excluded = excluded_pairs(recent);
    let mut best: Option<(usize, usize, u32)> = None;
    for i in 0..by_battles.len() {
        for j in (i + 1)..by_battles.len() {
            let combined = by_battles[i].battle_count + by_battles[j].battle_count;
            if best.is_some_and(|(_, _, c)| combined >= c) {
                // Sorted ascending: no later j can beat the current best for this i.
                break;
            }
            if !excluded.contains(&pair_key(&by_battles[i].item_id, &by_battles[j].item_id)) {
                best = Some((i, j, combined));
            }
        }
    }

    let (i, j) = best.map_or((0, 1), |(i, j, _)| (i, j));
    Selection {
        item_a: by_battles[i].item_id.clone(),
        item_b: by_battles[j].item_id.clone(),
        score: 0.0,
        source: SelectionSource::Fallback,
    }
}

/// Unique, finite candidates sorted by item id (the later record wins on duplicates)
fn live_candidates(candidates: &[Rating]) -> Vec<&Rating> {
    let mut by_id: FxHashMap<&ItemId, &Rating> = FxHashMap::default();
    for r in candidates.iter().filter(|r| r.is_finite()) {
        by_id.insert(&r.item_id, r);
    }
    let mut pool: Vec<&Rating> = by_id.into_values().collect();
    pool.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    pool
}

/// The most recent `limit` resolved battles, in the order given
fn recent_resolved(history: &[Battle], limit: usize) -> Vec<&Battle> {
    let resolved: Vec<&Battle> = history.iter().filter(|b| b.is_resolved()).collect();
    let skip = resolved.len().saturating_sub(limit);
    resolved.into_iter().skip(skip).collect()
}

fn recent_opponents<'a>(recent: &[&'a Battle], item: &ItemId) -> FxHashSet<&'a ItemId> {
    recent.iter().filter_map(|b| b.opponent_of(item)).collect()
}

fn excluded_pairs(recent: &[&Battle]) -> FxHashSet<(ItemId, ItemId)> {
    recent.iter().map(|b| pair_key(&b.item_a, &b.item_b)).collect()
}

fn pair_key(a: &ItemId, b: &ItemId) -> (ItemId, ItemId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn bucket_of(ordinal: f64, width: f64) -> i64 {
    (ordinal / width).floor() as i64
}
