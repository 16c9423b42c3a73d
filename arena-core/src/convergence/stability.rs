//! Ranking stability across consecutive windows of rating history
//!
//! Level 2 - one of the three statistical signals

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::config::ConvergenceConfig;
use crate::types::{ContextSnapshot, ItemId, RatingRecord};

/// Ranking induced by one window of rating records
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub index: usize,
    /// Battles covered up to the end of this window
    pub battle_count: usize,
    pub ranking: Vec<ItemId>,
    pub average_sigma: f64,
    /// Similarity to the previous window, absent for the first one
    pub similarity: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityResult {
    pub is_stable: bool,
    pub score: f64,
    pub consecutive_stable_windows: usize,
    pub windows: Vec<WindowSummary>,
}

/// Compare the rankings of the most recent history windows and the current ranking.
pub fn analyze(snapshot: &ContextSnapshot, config: &ConvergenceConfig) -> StabilityResult {
    let total = snapshot.total_battles;
    if total < config.stability_min_battles {
        let warmup = total as f64 / config.stability_min_battles as f64 * 0.6;
        return StabilityResult {
            score: warmup.min(0.6),
            ..Default::default()
        };
    }

    let window_size = config.window_size(snapshot.item_count()).max(1);
    let num_windows = config.stability_max_windows.min(total / window_size);
    if num_windows < 2 {
        return StabilityResult::default();
    }

    let mut windows = history_windows(&snapshot.history, window_size, num_windows);
    windows.push(WindowSummary {
        index: windows.len(),
        battle_count: total,
        ranking: snapshot.ranking(),
        average_sigma: snapshot.average_sigma(),
        similarity: None,
    });

    let similarities: Vec<f64> = (1..windows.len())
        .into_par_iter()
        .map(|i| ranking_similarity(&windows[i - 1].ranking, &windows[i].ranking))
        .collect();

    let mut consecutive = 0;
    for (i, &similarity) in similarities.iter().enumerate() {
        windows[i + 1].similarity = Some(similarity);
        if similarity > config.stable_similarity {
            consecutive += 1;
        } else {
            consecutive = 0;
        }
    }

    let score = if similarities.is_empty() {
        0.0
    } else {
        similarities.iter().sum::<f64>() / similarities.len() as f64
    };

    StabilityResult {
        is_stable: consecutive >= 1,
        score,
        consecutive_stable_windows: consecutive,
        windows,
    }
}

/// Kendall concordance of two rankings, mapped to [0, 1].
///
/// Only items present in both rankings are compared. Fewer than two shared
/// items gives 0; no comparable pair gives 1.
pub fn ranking_similarity(first: &[ItemId], second: &[ItemId]) -> f64 {
    let second_pos: FxHashMap<&ItemId, usize> = second.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let common: Vec<(usize, usize)> = first
        .iter()
        .enumerate()
        .filter_map(|(i, id)| second_pos.get(id).map(|&j| (i, j)))
        .collect();

    if common.len() < 2 {
        return 0.0;
    }

    let mut concordant = 0i64;
    let mut discordant = 0i64;
    for x in 0..common.len() {
        for y in (x + 1)..common.len() {
            let order_first = common[x].0 as i64 - common[y].0 as i64;
            let order_second = common[x].1 as i64 - common[y].1 as i64;
            match (order_first * order_second).signum() {
                1 => concordant += 1,
                -1 => discordant += 1,
                _ => {}
            }
        }
    }

    let pairs = concordant + discordant;
    if pairs == 0 {
        return 1.0;
    }
    let tau = (concordant - discordant) as f64 / pairs as f64;
    (tau + 1.0) / 2.0
}

/// Split battle-produced records into full windows and keep the newest `limit`.
fn history_windows(history: &[RatingRecord], window_size: usize, limit: usize) -> Vec<WindowSummary> {
    let battle_records: Vec<&RatingRecord> = history.iter().filter(|r| r.battle_id.is_some()).collect();
    let chunks: Vec<&[&RatingRecord]> = battle_records.chunks_exact(window_size).collect();
    let skip = chunks.len().saturating_sub(limit);

    chunks
        .into_iter()
        .enumerate()
        .skip(skip)
        .enumerate()
        .map(|(index, (chunk_no, chunk))| summarize_window(index, (chunk_no + 1) * window_size, chunk))
        .collect()
}

fn summarize_window(index: usize, battle_count: usize, records: &[&RatingRecord]) -> WindowSummary {
    // Latest record per item inside the window
    let mut latest: FxHashMap<&ItemId, &RatingRecord> = FxHashMap::default();
    for record in records {
        latest.insert(&record.rating.item_id, record);
    }

    let mut entries: Vec<&RatingRecord> = latest.into_values().collect();
    entries.sort_by(|a, b| {
        b.rating
            .ordinal
            .partial_cmp(&a.rating.ordinal)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rating.item_id.cmp(&b.rating.item_id))
    });

    let average_sigma = if entries.is_empty() {
        0.0
    } else {
        entries.iter().map(|r| r.rating.sigma).sum::<f64>() / entries.len() as f64
    };

    WindowSummary {
        index,
        battle_count,
        ranking: entries.iter().map(|r| r.rating.item_id.clone()).collect(),
        average_sigma,
        similarity: None,
    }
}
