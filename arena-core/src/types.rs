//! Data model shared by every arena crate
//!
//! Identifiers, ratings, battles and the point-in-time snapshot that the
//! selector and the convergence detector read from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a ranked item, unique within one context.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an evaluation context (an isolated pool with its own history).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a single battle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleId(Uuid);

impl BattleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BattleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a battle from the perspective of the A side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    AWin,
    BWin,
    Draw,
    Pending,
}

impl Outcome {
    /// Whether the battle has been decided.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    /// Score for side A: 1.0 win, 0.5 draw, 0.0 loss.
    pub fn score_for_a(self) -> Option<f64> {
        match self {
            Outcome::AWin => Some(1.0),
            Outcome::BWin => Some(0.0),
            Outcome::Draw => Some(0.5),
            Outcome::Pending => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::AWin => "A_WIN",
            Outcome::BWin => "B_WIN",
            Outcome::Draw => "DRAW",
            Outcome::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

/// Skill estimate of one item in one context.
///
/// `ordinal` is always `mu - 3 * sigma`; use [`Rating::with_skill`] to keep
/// it in sync when changing `mu` or `sigma`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub item_id: ItemId,
    pub context_id: ContextId,
    pub mu: f64,
    pub sigma: f64,
    pub ordinal: f64,
    pub battle_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Rating {
    /// Replace `mu`/`sigma` and recompute the ordinal
    pub fn with_skill(mut self, mu: f64, sigma: f64) -> Self {
        self.mu = mu;
        self.sigma = sigma;
        self.ordinal = ordinal(mu, sigma);
        self
    }

    /// True when both skill parameters are usable numbers.
    pub fn is_finite(&self) -> bool {
        self.mu.is_finite() && self.sigma.is_finite() && self.sigma >= 0.0
    }
}

/// Conservative point estimate used for ranking.
pub fn ordinal(mu: f64, sigma: f64) -> f64 {
    mu - 3.0 * sigma
}

/// One entry in an item's append-only rating history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub rating: Rating,
    /// Battle that produced this record; `None` for the seed record.
    pub battle_id: Option<BattleId>,
}

impl RatingRecord {
    pub fn seed(rating: Rating) -> Self {
        Self { rating, battle_id: None }
    }

    pub fn from_battle(rating: Rating, battle_id: BattleId) -> Self {
        Self {
            rating,
            battle_id: Some(battle_id),
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.rating.updated_at
    }

    /// Ordinal movement relative to the record this one replaced.
    pub fn ordinal_change(&self, previous: &RatingRecord) -> f64 {
        self.rating.ordinal - previous.rating.ordinal
    }
}

/// One pairwise comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Battle {
    pub id: BattleId,
    pub context_id: ContextId,
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub outcome: Outcome,
    pub judge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Battle {
    /// Create a pending battle between two items
    pub fn pending(context_id: ContextId, item_a: ItemId, item_b: ItemId, now: DateTime<Utc>) -> Self {
        Self {
            id: BattleId::new(),
            context_id,
            item_a,
            item_b,
            outcome: Outcome::Pending,
            judge_id: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_resolved()
    }

    /// Whether this battle was between `a` and `b`, in either order.
    pub fn involves_pair(&self, a: &ItemId, b: &ItemId) -> bool {
        (&self.item_a == a && &self.item_b == b) || (&self.item_a == b && &self.item_b == a)
    }

    /// The other participant, if `item` took part.
    pub fn opponent_of(&self, item: &ItemId) -> Option<&ItemId> {
        if &self.item_a == item {
            Some(&self.item_b)
        } else if &self.item_b == item {
            Some(&self.item_a)
        } else {
            None
        }
    }

    /// Ordering key: completion time, falling back to creation time.
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Point-in-time view of a context, fetched once per decision.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub context_id: Option<ContextId>,
    /// Current rating of every item in the pool.
    pub ratings: Vec<Rating>,
    /// Rating records of the context in chronological order.
    #[serde(default)]
    pub history: Vec<RatingRecord>,
    /// Resolved battles in chronological order (may be truncated to the most recent).
    #[serde(default)]
    pub battles: Vec<Battle>,
    /// Count of all resolved battles in the context.
    pub total_battles: usize,
    pub taken_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn item_count(&self) -> usize {
        self.ratings.len()
    }

    pub fn average_sigma(&self) -> f64 {
        if self.ratings.is_empty() {
            return 0.0;
        }
        self.ratings.iter().map(|r| r.sigma).sum::<f64>() / self.ratings.len() as f64
    }

    pub fn min_battle_count(&self) -> u32 {
        self.ratings.iter().map(|r| r.battle_count).min().unwrap_or(0)
    }

    /// Items ordered by ordinal, best first.
    pub fn ranking(&self) -> Vec<ItemId> {
        let mut sorted: Vec<&Rating> = self.ratings.iter().collect();
        sorted.sort_by(|a, b| {
            b.ordinal
                .partial_cmp(&a.ordinal)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        sorted.into_iter().map(|r| r.item_id.clone()).collect()
    }
}
