//! Per-context smoothing of the reported progress percentage
//!
//! Level 4 - Utilities

use rustc_hash::FxHashMap;

use crate::types::ContextId;

/// Bounds how far the reported progress of a context may move per call.
#[derive(Clone, Debug)]
pub struct ProgressSmoother {
    max_step: f64,
    last: FxHashMap<ContextId, f64>,
}

impl ProgressSmoother {
    pub fn new(max_step: f64) -> Self {
        Self {
            max_step,
            last: FxHashMap::default(),
        }
    }

    /// Clamp `raw` to within `max_step` of the last value reported for the
    /// context. The first observation of a context is reported as is.
    pub fn smooth(&mut self, context: &ContextId, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 100.0);
        let reported = match self.last.get(context) {
            Some(&last) => raw.clamp(last - self.max_step, last + self.max_step),
            None => raw,
        };
        self.last.insert(context.clone(), reported);
        reported
    }

    /// Forget a context, e.g. once it has converged
    pub fn reset(&mut self, context: &ContextId) {
        self.last.remove(context);
    }

    pub fn last(&self, context: &ContextId) -> Option<f64> {
        self.last.get(context).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jumps_are_bounded() {
        let mut smoother = ProgressSmoother::new(15.0);
        let ctx = ContextId::from("a");
        assert_eq!(smoother.smooth(&ctx, 10.0), 10.0);
        assert_eq!(smoother.smooth(&ctx, 90.0), 25.0);
        assert_eq!(smoother.smooth(&ctx, 90.0), 40.0);
        assert_eq!(smoother.smooth(&ctx, 0.0), 25.0);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut smoother = ProgressSmoother::new(15.0);
        let a = ContextId::from("a");
        let b = ContextId::from("b");
        smoother.smooth(&a, 5.0);
        assert_eq!(smoother.smooth(&b, 80.0), 80.0);
        assert_eq!(smoother.smooth(&a, 80.0), 20.0);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut smoother = ProgressSmoother::new(15.0);
        let ctx = ContextId::from("a");
        smoother.smooth(&ctx, 5.0);
        smoother.reset(&ctx);
        assert_eq!(smoother.last(&ctx), None);
        assert_eq!(smoother.smooth(&ctx, 70.0), 70.0);
    }
}
