//! The judge seam: whoever decides a battle
//!
//! Judging logic itself (a human queue, a model call) lives outside this
//! crate; the coordinator only needs a verdict or an error.

use arena_core::{ContextId, ItemId, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JudgeError;

/// What the judge is asked to decide
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub context_id: ContextId,
    pub item_a: ItemId,
    pub item_b: ItemId,
    /// Free-form evaluation criteria passed through from configuration
    pub criteria: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: Outcome,
    /// Identity of whoever decided, stored on the battle
    pub judge_id: Option<String>,
}

impl Verdict {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome, judge_id: None }
    }

    pub fn with_judge(mut self, judge_id: impl Into<String>) -> Self {
        self.judge_id = Some(judge_id.into());
        self
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError>;
}

/// Judge backed by a synchronous closure
pub struct FnJudge<F> {
    name: String,
    decide: F,
}

impl<F> FnJudge<F>
where
    F: Fn(&JudgeRequest) -> Result<Outcome, JudgeError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, decide: F) -> Self {
        Self {
            name: name.into(),
            decide,
        }
    }
}

#[async_trait]
impl<F> Judge for FnJudge<F>
where
    F: Fn(&JudgeRequest) -> Result<Outcome, JudgeError> + Send + Sync,
{
    async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError> {
        let outcome = (self.decide)(request)?;
        if !outcome.is_resolved() {
            return Err(JudgeError::Failed(format!("{} returned no decision", self.name)));
        }
        Ok(Verdict::new(outcome).with_judge(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JudgeRequest {
        JudgeRequest {
            context_id: "ctx".into(),
            item_a: "a".into(),
            item_b: "b".into(),
            criteria: None,
        }
    }

    #[tokio::test]
    async fn test_fn_judge_tags_verdict() {
        let judge = FnJudge::new("always-a", |_: &JudgeRequest| Ok(Outcome::AWin));
        let verdict = judge.judge(&request()).await.unwrap();
        assert_eq!(verdict.outcome, Outcome::AWin);
        assert_eq!(verdict.judge_id.as_deref(), Some("always-a"));
    }

    #[tokio::test]
    async fn test_pending_is_not_a_verdict() {
        let judge = FnJudge::new("undecided", |_: &JudgeRequest| Ok(Outcome::Pending));
        assert!(matches!(judge.judge(&request()).await, Err(JudgeError::Failed(_))));
    }
}
