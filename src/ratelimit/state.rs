//! Per-key limiter state and admission verdicts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::quota::{whole_units, TICKS_PER_UNIT};

/// Mutable per-key state. The variant is fixed by the algorithm in use.
///
/// Budget levels are stored in ticks (see [`super::quota`]); use the accessor
/// methods for whole units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterState {
    TokenBucket {
        tokens: u128,
        last_refill_at: Timestamp,
    },
    SlidingWindow {
        window_start: Timestamp,
        last_hit_at: Timestamp,
        count_in_window: u64,
        prev_window_start: Timestamp,
        prev_last_hit_at: Timestamp,
        count_in_prev_window: u64,
    },
    LeakyBucket {
        level: u128,
        last_leak_at: Timestamp,
    },
}

impl LimiterState {
    /// A token bucket holding `tokens` whole units.
    pub fn token_bucket(tokens: u64, at: Timestamp) -> Self {
        LimiterState::TokenBucket {
            tokens: u128::from(tokens) * TICKS_PER_UNIT,
            last_refill_at: at,
        }
    }

    /// A leaky bucket filled to `level` whole units.
    pub fn leaky_bucket(level: u64, at: Timestamp) -> Self {
        LimiterState::LeakyBucket {
            level: u128::from(level) * TICKS_PER_UNIT,
            last_leak_at: at,
        }
    }

    /// An empty sliding window opened at `at`.
    pub fn empty_window(at: Timestamp) -> Self {
        LimiterState::SlidingWindow {
            window_start: at,
            last_hit_at: at,
            count_in_window: 0,
            prev_window_start: at,
            prev_last_hit_at: at,
            count_in_prev_window: 0,
        }
    }

    /// Whole tokens held, for token bucket state.
    pub fn tokens(&self) -> Option<u64> {
        match self {
            LimiterState::TokenBucket { tokens, .. } => Some(whole_units(*tokens)),
            _ => None,
        }
    }

    /// Queue level in whole units (rounded down), for leaky bucket state.
    pub fn queue_level(&self) -> Option<u64> {
        match self {
            LimiterState::LeakyBucket { level, .. } => Some(whole_units(*level)),
            _ => None,
        }
    }

    /// Latest timestamp recorded in this state.
    pub fn last_updated(&self) -> Timestamp {
        match self {
            LimiterState::TokenBucket { last_refill_at, .. } => *last_refill_at,
            LimiterState::SlidingWindow { last_hit_at, .. } => *last_hit_at,
            LimiterState::LeakyBucket { last_leak_at, .. } => *last_leak_at,
        }
    }
}

/// Result of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admitted. `remaining` whole units are left; the budget is fully
    /// restored at `reset_at` if nothing else is spent.
    Allowed { remaining: u64, reset_at: Timestamp },
    /// Rejected. The same request may succeed after `retry_after`.
    Denied { retry_after: Duration },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }

    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }

    /// Remaining budget; zero for a denial.
    pub fn remaining(&self) -> u64 {
        match self {
            Verdict::Allowed { remaining, .. } => *remaining,
            Verdict::Denied { .. } => 0,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Verdict::Allowed { .. } => None,
            Verdict::Denied { retry_after } => Some(*retry_after),
        }
    }
}

/// Output of a strategy: the verdict, plus the state to persist.
///
/// `state` is `None` when the decision leaves the stored state as it was, in
/// which case nothing needs to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub state: Option<LimiterState>,
    pub verdict: Verdict,
}

impl Decision {
    pub fn update(state: LimiterState, verdict: Verdict) -> Self {
        Self {
            state: Some(state),
            verdict,
        }
    }

    pub fn unchanged(verdict: Verdict) -> Self {
        Self {
            state: None,
            verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_accessors() {
        let at = Timestamp::from_secs(1);
        assert_eq!(LimiterState::token_bucket(7, at).tokens(), Some(7));
        assert_eq!(LimiterState::token_bucket(7, at).queue_level(), None);
        assert_eq!(LimiterState::leaky_bucket(3, at).queue_level(), Some(3));
        assert_eq!(LimiterState::empty_window(at).last_updated(), at);
    }

    #[test]
    fn test_state_json_encoding() {
        let state = LimiterState::token_bucket(u64::MAX, Timestamp::from_secs(9));
        let encoded = serde_json::to_string(&state).unwrap();
        assert!(encoded.starts_with("{\"token_bucket\""));

        let decoded: LimiterState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_verdict_helpers() {
        let allowed = Verdict::Allowed {
            remaining: 4,
            reset_at: Timestamp::ZERO,
        };
        let denied = Verdict::Denied {
            retry_after: Duration::from_secs(1),
        };

        assert!(allowed.is_allowed());
        assert_eq!(allowed.remaining(), 4);
        assert_eq!(allowed.retry_after(), None);
        assert!(denied.is_denied());
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));
    }
}
