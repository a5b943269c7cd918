//! Token accounting that decides when a worker session must be rotated.

use serde::Serialize;

/// Tracks tokens spent in the current conversation against a rotation threshold.
///
/// The threshold is deliberately far below the model's real context window; it
/// bounds how much history a single conversation may accumulate.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextGuard {
    threshold_percentage: f64,
    max_context: u64,
    threshold_tokens: u64,
    current_tokens: u64,
}

/// Point-in-time view of the guard, for logs and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GuardStatus {
    pub current_tokens: u64,
    pub threshold_tokens: u64,
    pub threshold_percentage: f64,
    pub usage_percentage: f64,
    pub should_rotate: bool,
}

impl ContextGuard {
    pub fn new(threshold_percentage: f64, max_context: u64) -> Self {
        let threshold_tokens = (max_context as f64 * threshold_percentage / 100.0).floor() as u64;
        Self {
            threshold_percentage,
            max_context,
            threshold_tokens,
            current_tokens: 0,
        }
    }

    pub fn add_tokens(&mut self, count: u64) {
        self.current_tokens = self.current_tokens.saturating_add(count);
    }

    pub fn should_rotate(&self) -> bool {
        self.current_tokens >= self.threshold_tokens
    }

    /// Usage relative to the rotation threshold, not the hard maximum.
    pub fn usage_percentage(&self) -> f64 {
        if self.threshold_tokens == 0 {
            return 100.0;
        }
        self.current_tokens as f64 / self.threshold_tokens as f64 * 100.0
    }

    /// Zero the counter. Only [`crate::session::WorkerContext::rotate`] calls this,
    /// together with discarding the conversation.
    pub(crate) fn reset(&mut self) {
        self.current_tokens = 0;
    }

    pub fn current_tokens(&self) -> u64 {
        self.current_tokens
    }

    pub fn threshold_tokens(&self) -> u64 {
        self.threshold_tokens
    }

    pub fn threshold_percentage(&self) -> f64 {
        self.threshold_percentage
    }

    pub fn max_context(&self) -> u64 {
        self.max_context
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            current_tokens: self.current_tokens,
            threshold_tokens: self.threshold_tokens,
            threshold_percentage: self.threshold_percentage,
            usage_percentage: self.usage_percentage(),
            should_rotate: self.should_rotate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_floor_of_percentage() {
        let guard = ContextGuard::new(10.0, 1_000_000);
        assert_eq!(guard.threshold_tokens(), 100_000);

        let odd = ContextGuard::new(12.5, 1_001);
        assert_eq!(odd.threshold_tokens(), 125);
    }

    #[test]
    fn rotates_exactly_at_threshold_and_resets() {
        let mut guard = ContextGuard::new(10.0, 1_000_000);
        guard.add_tokens(99_999);
        assert!(!guard.should_rotate());
        guard.add_tokens(1);
        assert!(guard.should_rotate());

        guard.reset();
        assert_eq!(guard.current_tokens(), 0);
        assert!(!guard.should_rotate());
    }

    #[test]
    fn usage_is_relative_to_threshold() {
        let mut guard = ContextGuard::new(10.0, 1_000_000);
        guard.add_tokens(25_000);
        assert!((guard.usage_percentage() - 25.0).abs() < f64::EPSILON);
        let status = guard.status();
        assert_eq!(status.current_tokens, 25_000);
        assert!(!status.should_rotate);
    }
}
