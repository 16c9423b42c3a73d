//! Arena Core - ratings, matchmaking and convergence for pairwise ranking
//!
//! This crate provides the pure computation behind an adaptive ranking arena:
//! - Skill ratings updated from pairwise battles (OpenSkill Plackett-Luce)
//! - Selection of the next most informative pair
//! - Detection of when a context has converged
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: ConvergenceDetector::should_stop, select_next_pair (orchestration)
//! - Level 2: RatingEngine::update_ratings, convergence signals (phases)
//! - Level 3: team updates, pair scoring, window rankings (steps)
//! - Level 4: data model, configuration
//!
//! Nothing here performs I/O or async work; callers pass in a
//! [`ContextSnapshot`] and timestamps explicitly.

pub mod convergence;
mod error;
pub mod matchmaking;
mod rating;
mod types;

pub use convergence::{ConvergenceConfig, ConvergenceDecision, ConvergenceDetector, DetectionMode};
pub use error::{ConvergenceError, RatingError};
pub use matchmaking::{select_next_pair, Matchmaker, MatchmakingConfig, Selection, SelectionSource};
pub use rating::{RatingEngine, RatingModel, DEFAULT_MU, DEFAULT_SIGMA};
pub use types::{ordinal, Battle, BattleId, ContextId, ContextSnapshot, ItemId, Outcome, Rating, RatingRecord};
