//! Error types for the pure computation layer

use crate::types::{ContextId, ItemId};

/// Errors from the rating engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RatingError {
    #[error("no seeded rating for item {item} in context {context}")]
    MissingRating { item: ItemId, context: ContextId },

    #[error("invalid battle: {0}")]
    Validation(String),
}

/// Errors raised while evaluating convergence
///
/// These never reach callers of `ConvergenceDetector::should_stop`; they are
/// turned into a conservative "continue" decision.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvergenceError {
    #[error("need at least 2 items to judge convergence, found {0}")]
    InsufficientItems(usize),

    #[error("rating for item {0} is not a finite number")]
    NonFiniteRating(ItemId),
}
