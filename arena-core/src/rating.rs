//! Rating engine - OpenSkill (Weng-Lin) Plackett-Luce updates
//!
//! Level 3 - Steps: pure functions over two ratings and an outcome.
//!
//! Every battle is modelled as a match between two single-member teams. The
//! winner is ranked 0 and the loser 1; a draw ranks both 0, which is the
//! tie form of the Plackett-Luce update.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::RatingError;
use crate::types::{ordinal, Battle, ContextId, ItemId, Outcome, Rating};

/// Default prior mean
pub const DEFAULT_MU: f64 = 25.0;
/// Default prior uncertainty (mu / 3)
pub const DEFAULT_SIGMA: f64 = DEFAULT_MU / 3.0;

/// Parameters of the rating model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingModel {
    /// Prior mean for a fresh item
    pub mu: f64,
    /// Prior uncertainty for a fresh item
    pub sigma: f64,
    /// Performance variance scale (distance that means ~76% win chance)
    pub beta: f64,
    /// Floor for the sigma shrink factor, keeps sigma strictly positive
    pub kappa: f64,
}

impl Default for RatingModel {
    fn default() -> Self {
        Self {
            mu: DEFAULT_MU,
            sigma: DEFAULT_SIGMA,
            beta: DEFAULT_SIGMA / 2.0,
            kappa: 0.0001,
        }
    }
}

/// Deterministic, side-effect-free rating updates
#[derive(Clone, Debug, Default)]
pub struct RatingEngine {
    model: RatingModel,
}

impl RatingEngine {
    pub fn new(model: RatingModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &RatingModel {
        &self.model
    }

    /// Seed rating for an item entering a context
    pub fn create_initial_rating(&self, item_id: ItemId, context_id: ContextId, at: DateTime<Utc>) -> Rating {
        Rating {
            item_id,
            context_id,
            mu: self.model.mu,
            sigma: self.model.sigma,
            ordinal: ordinal(self.model.mu, self.model.sigma),
            battle_count: 0,
            updated_at: at,
        }
    }

    /// Compute both post-battle ratings.
    ///
    /// `at` becomes `updated_at` on both results so that identical inputs
    /// always produce identical outputs.
    pub fn update_ratings(
        &self,
        rating_a: &Rating,
        rating_b: &Rating,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<(Rating, Rating), RatingError> {
        validate_pair(rating_a, rating_b)?;

        let ranks = match outcome {
            Outcome::AWin => [0, 1],
            Outcome::BWin => [1, 0],
            Outcome::Draw => [0, 0],
            Outcome::Pending => {
                return Err(RatingError::Validation(
                    "cannot rate a battle that is still pending".to_string(),
                ))
            }
        };

        let teams = [(rating_a.mu, rating_a.sigma), (rating_b.mu, rating_b.sigma)];
        let updated = self.rate_teams(&teams, &ranks);

        let new_a = advance(rating_a, updated[0], at);
        let new_b = advance(rating_b, updated[1], at);
        Ok((new_a, new_b))
    }

    /// Resolve a battle against a map of current ratings.
    ///
    /// Fails with [`RatingError::MissingRating`] when either participant has
    /// never been seeded in the battle's context.
    pub fn resolve(
        &self,
        battle: &Battle,
        outcome: Outcome,
        current: &FxHashMap<ItemId, Rating>,
        at: DateTime<Utc>,
    ) -> Result<(Rating, Rating), RatingError> {
        let lookup = |item: &ItemId| {
            current.get(item).ok_or_else(|| RatingError::MissingRating {
                item: item.clone(),
                context: battle.context_id.clone(),
            })
        };
        let rating_a = lookup(&battle.item_a)?;
        let rating_b = lookup(&battle.item_b)?;
        self.update_ratings(rating_a, rating_b, outcome, at)
    }

    /// Probability that A beats B under the Plackett-Luce model
    pub fn win_probability(&self, rating_a: &Rating, rating_b: &Rating) -> f64 {
        let c = self.team_scale(&[(rating_a.mu, rating_a.sigma), (rating_b.mu, rating_b.sigma)]);
        let ea = (rating_a.mu / c).exp();
        let eb = (rating_b.mu / c).exp();
        ea / (ea + eb)
    }

    /// Match quality: 1.0 for a coin flip, approaching 0.0 for a mismatch
    pub fn match_quality(&self, rating_a: &Rating, rating_b: &Rating) -> f64 {
        let p = self.win_probability(rating_a, rating_b);
        1.0 - (p - (1.0 - p)).abs()
    }

    // ========================================================================
    // Level 4 - Plackett-Luce math
    // ========================================================================

    fn team_scale(&self, teams: &[(f64, f64)]) -> f64 {
        let beta_sq = self.model.beta * self.model.beta;
        teams
            .iter()
            .map(|&(_, sigma)| sigma * sigma + beta_sq)
            .sum::<f64>()
            .sqrt()
    }

    /// Plackett-Luce update for single-member teams; lower rank is better,
    /// equal ranks are ties.
    fn rate_teams(&self, teams: &[(f64, f64)], ranks: &[u32]) -> Vec<(f64, f64)> {
        let c = self.team_scale(teams);
        let exp_mu: Vec<f64> = teams.iter().map(|&(mu, _)| (mu / c).exp()).collect();

        // Sum over every team ranked no better than q, and the size of q's tie group.
        let sum_q: Vec<f64> = (0..teams.len())
            .map(|q| {
                (0..teams.len())
                    .filter(|&i| ranks[i] >= ranks[q])
                    .map(|i| exp_mu[i])
                    .sum()
            })
            .collect();
        let tie_size: Vec<f64> = (0..teams.len())
            .map(|q| ranks.iter().filter(|&&r| r == ranks[q]).count() as f64)
            .collect();

        (0..teams.len())
            .map(|i| {
                let (mu, sigma) = teams[i];
                let sigma_sq = sigma * sigma;
                let mut omega = 0.0;
                let mut delta = 0.0;

                for q in (0..teams.len()).filter(|&q| ranks[q] <= ranks[i]) {
                    let quotient = exp_mu[i] / sum_q[q];
                    if i == q {
                        omega += (1.0 - quotient) / tie_size[q];
                    } else {
                        omega -= quotient / tie_size[q];
                    }
                    delta += quotient * (1.0 - quotient) / tie_size[q];
                }

                let gamma = sigma / c;
                let new_mu = mu + sigma_sq / c * omega;
                let shrink = (1.0 - gamma * delta * sigma_sq / (c * c)).max(self.model.kappa);
                (new_mu, sigma * shrink.sqrt())
            })
            .collect()
    }
}

fn validate_pair(rating_a: &Rating, rating_b: &Rating) -> Result<(), RatingError> {
    if rating_a.item_id == rating_b.item_id {
        return Err(RatingError::Validation(format!(
            "item {} cannot battle itself",
            rating_a.item_id
        )));
    }
    if rating_a.context_id != rating_b.context_id {
        return Err(RatingError::Validation(format!(
            "items belong to different contexts ({} vs {})",
            rating_a.context_id, rating_b.context_id
        )));
    }
    if !rating_a.is_finite() || !rating_b.is_finite() {
        return Err(RatingError::Validation("ratings must be finite".to_string()));
    }
    Ok(())
}

fn advance(previous: &Rating, (mu, sigma): (f64, f64), at: DateTime<Utc>) -> Rating {
    Rating {
        battle_count: previous.battle_count + 1,
        updated_at: at,
        ..previous.clone()
    }
    .with_skill(mu, sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn seeded(engine: &RatingEngine, id: &str) -> Rating {
        engine.create_initial_rating(ItemId::from(id), ContextId::from("ctx"), at())
    }

    #[test]
    fn test_initial_rating_defaults() {
        let engine = RatingEngine::default();
        let r = seeded(&engine, "a");
        assert_eq!(r.mu, 25.0);
        assert!((r.sigma - 8.333).abs() < 0.001);
        assert!(r.ordinal.abs() < 1e-9);
        assert_eq!(r.battle_count, 0);
    }

    #[test]
    fn test_win_moves_ratings_apart() {
        let engine = RatingEngine::default();
        let (a, b) = (seeded(&engine, "a"), seeded(&engine, "b"));
        let (na, nb) = engine.update_ratings(&a, &b, Outcome::AWin, at()).unwrap();

        assert!(na.mu > a.mu);
        assert!(nb.mu < b.mu);
        assert!(na.sigma < a.sigma);
        assert!(nb.sigma < b.sigma);
        assert!(na.ordinal > a.ordinal);
        assert!(nb.ordinal < b.ordinal);
        assert_eq!(na.battle_count, 1);
        assert_eq!(nb.battle_count, 1);
        // Known OpenSkill values for two fresh players
        assert!((na.mu - 27.635).abs() < 0.01);
        assert!((nb.mu - 22.365).abs() < 0.01);
        assert!((na.sigma - 8.0655).abs() < 0.01);
    }

    #[test]
    fn test_b_win_mirrors_a_win() {
        let engine = RatingEngine::default();
        let (a, b) = (seeded(&engine, "a"), seeded(&engine, "b"));
        let (wa, wb) = engine.update_ratings(&a, &b, Outcome::AWin, at()).unwrap();
        let (la, lb) = engine.update_ratings(&a, &b, Outcome::BWin, at()).unwrap();
        assert!((wa.mu - lb.mu).abs() < 1e-12);
        assert!((wb.mu - la.mu).abs() < 1e-12);
    }

    #[test]
    fn test_draw_between_equals_keeps_mu() {
        let engine = RatingEngine::default();
        let (a, b) = (seeded(&engine, "a"), seeded(&engine, "b"));
        let (na, nb) = engine.update_ratings(&a, &b, Outcome::Draw, at()).unwrap();
        assert!((na.mu - 25.0).abs() < 1e-9);
        assert!((nb.mu - 25.0).abs() < 1e-9);
        assert!(na.sigma < a.sigma);
        assert!((na.sigma - nb.sigma).abs() < 1e-12);
    }

    #[test]
    fn test_draw_pulls_ratings_together() {
        let engine = RatingEngine::default();
        let strong = seeded(&engine, "a").with_skill(32.0, 5.0);
        let weak = seeded(&engine, "b").with_skill(20.0, 5.0);
        let (ns, nw) = engine.update_ratings(&strong, &weak, Outcome::Draw, at()).unwrap();
        assert!(ns.mu < strong.mu);
        assert!(nw.mu > weak.mu);
    }

    #[test]
    fn test_update_is_deterministic() {
        let engine = RatingEngine::default();
        let a = seeded(&engine, "a").with_skill(27.1, 6.2);
        let b = seeded(&engine, "b").with_skill(23.4, 7.9);
        let first = engine.update_ratings(&a, &b, Outcome::BWin, at()).unwrap();
        let second = engine.update_ratings(&a, &b, Outcome::BWin, at()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_pending_and_self_pairing() {
        let engine = RatingEngine::default();
        let a = seeded(&engine, "a");
        let b = seeded(&engine, "b");
        assert!(matches!(
            engine.update_ratings(&a, &b, Outcome::Pending, at()),
            Err(RatingError::Validation(_))
        ));
        assert!(matches!(
            engine.update_ratings(&a, &a, Outcome::AWin, at()),
            Err(RatingError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_requires_seeded_ratings() {
        let engine = RatingEngine::default();
        let a = seeded(&engine, "a");
        let mut current = FxHashMap::default();
        current.insert(a.item_id.clone(), a);

        let battle = Battle::pending("ctx".into(), "a".into(), "ghost".into(), at());
        let err = engine.resolve(&battle, Outcome::AWin, &current, at()).unwrap_err();
        assert_eq!(
            err,
            RatingError::MissingRating {
                item: ItemId::from("ghost"),
                context: ContextId::from("ctx"),
            }
        );
    }

    #[test]
    fn test_match_quality_symmetric_and_peaks_for_equals() {
        let engine = RatingEngine::default();
        let a = seeded(&engine, "a");
        let b = seeded(&engine, "b");
        let c = seeded(&engine, "c").with_skill(40.0, 3.0);
        assert!((engine.match_quality(&a, &b) - 1.0).abs() < 1e-12);
        assert!((engine.match_quality(&a, &c) - engine.match_quality(&c, &a)).abs() < 1e-12);
        assert!(engine.match_quality(&a, &c) < engine.match_quality(&a, &b));
        assert!(engine.win_probability(&c, &a) > 0.5);
    }
}
