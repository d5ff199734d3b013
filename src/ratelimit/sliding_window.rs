//! Sliding window counter strategy.
//!
//! Hits are counted in a current window and the window before it. Each
//! window opens at the first request after the previous one expired and
//! remembers when its last hit landed. The previous window's count is
//! weighted by how much of its occupied span `[start, last hit]` still falls
//! inside the trailing window `(now - W, now]`, assuming hits were spread
//! evenly over that span:
//!
//! ```text
//! effective = prev * overlap / span + current
//! ```
//!
//! A burst that all landed at one instant therefore stops counting exactly
//! one window length later, while evenly spread traffic gets the usual
//! linear decay.

use std::time::Duration;

use tracing::debug;

use super::clock::Timestamp;
use super::quota::Quota;
use super::state::{Decision, LimiterState, Verdict};

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Timestamp,
    last_hit_at: Timestamp,
    count: u64,
}

/// Decide on a request of `cost` units at `now`.
///
/// A request costing more than the whole limit can never fit in a window and
/// is denied without touching state.
pub fn decide(state: Option<&LimiterState>, quota: &Quota, now: Timestamp, cost: u64) -> Decision {
    let window = quota.window();
    let limit = quota.limit();

    if cost > limit {
        return Decision::unchanged(Verdict::Denied {
            retry_after: window,
        });
    }

    let (mut current, mut previous) = match state {
        Some(LimiterState::SlidingWindow {
            window_start,
            last_hit_at,
            count_in_window,
            prev_window_start,
            prev_last_hit_at,
            count_in_prev_window,
        }) => (
            Window {
                start: *window_start,
                last_hit_at: *last_hit_at,
                count: *count_in_window,
            },
            Window {
                start: *prev_window_start,
                last_hit_at: *prev_last_hit_at,
                count: *count_in_prev_window,
            },
        ),
        _ => (Window::empty(now), Window::empty(now)),
    };

    if now < current.last_hit_at {
        debug!(
            now = %now,
            last_hit_at = %current.last_hit_at,
            "Clock moved backwards; treating elapsed time as zero"
        );
    }
    let now = now.max(current.last_hit_at);

    if now >= current.start + window {
        previous = current;
        current = Window::empty(now);
    }

    let trailing_start = Timestamp::from_nanos(
        now.as_nanos()
            .saturating_sub(u64::try_from(window.as_nanos()).unwrap_or(u64::MAX)),
    );
    let (num, den) = previous.weight(trailing_start);

    let budget = u128::from(limit) * den;
    let weighted_prev = u128::from(previous.count) * num;
    let needed = u128::from(current.count.saturating_add(cost)) * den;

    if weighted_prev + needed <= budget {
        current.count += cost;
        if cost > 0 {
            current.last_hit_at = now;
        }
        let used = weighted_prev + u128::from(current.count) * den;
        let remaining = u64::try_from((budget - used) / den).unwrap_or(u64::MAX);
        let latest_hit = [current, previous]
            .iter()
            .filter(|w| w.count > 0)
            .map(|w| w.last_hit_at)
            .max();
        let verdict = Verdict::Allowed {
            remaining,
            reset_at: latest_hit.map_or(now, |at| at + window),
        };
        Decision::update(current.into_state(previous), verdict)
    } else {
        let retry_at = if current.count + cost <= limit {
            // Wait for the previous window to decay enough.
            previous.decayed_to(limit - current.count - cost, window)
        } else {
            // Wait for the current window to roll over and then decay.
            current.decayed_to(limit - cost, window)
        };
        Decision::unchanged(Verdict::Denied {
            retry_after: now.until(retry_at).max(Duration::from_nanos(1)),
        })
    }
}

impl Window {
    fn empty(at: Timestamp) -> Self {
        Window {
            start: at,
            last_hit_at: at,
            count: 0,
        }
    }

    /// Fraction `(num, den)` of this window's span inside `(trailing_start, now]`.
    fn weight(&self, trailing_start: Timestamp) -> (u128, u128) {
        if self.count == 0 || self.last_hit_at <= trailing_start {
            return (0, 1);
        }
        if self.start > trailing_start {
            return (1, 1);
        }
        let span = self.last_hit_at.as_nanos() - self.start.as_nanos();
        let overlap = self.last_hit_at.as_nanos() - trailing_start.as_nanos();
        (u128::from(overlap), u128::from(span))
    }

    /// Earliest instant at which this window contributes at most `budget` hits.
    ///
    /// Callers guarantee `budget < count`.
    fn decayed_to(&self, budget: u64, window: Duration) -> Timestamp {
        let span = u128::from(self.last_hit_at.as_nanos() - self.start.as_nanos());
        let slack = u128::from(budget) * span / u128::from(self.count.max(1));
        let end = self.last_hit_at + window;
        Timestamp::from_nanos(
            end.as_nanos()
                .saturating_sub(u64::try_from(slack).unwrap_or(u64::MAX)),
        )
    }

    fn into_state(self, previous: Window) -> LimiterState {
        LimiterState::SlidingWindow {
            window_start: self.start,
            last_hit_at: self.last_hit_at,
            count_in_window: self.count,
            prev_window_start: previous.start,
            prev_last_hit_at: previous.last_hit_at,
            count_in_prev_window: previous.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(capacity: u64, window_secs: u64) -> Quota {
        Quota::new(capacity, capacity as f64 / window_secs as f64)
            .unwrap()
            .with_window(Duration::from_secs(window_secs))
            .unwrap()
    }

    fn step(state: &mut Option<LimiterState>, quota: &Quota, now: Timestamp, cost: u64) -> Verdict {
        let decision = decide(state.as_ref(), quota, now, cost);
        if let Some(next) = decision.state {
            *state = Some(next);
        }
        decision.verdict
    }

    #[test]
    fn test_counts_within_window() {
        let quota = quota(3, 10);
        let mut state = None;

        assert_eq!(step(&mut state, &quota, Timestamp::from_secs(0), 1).remaining(), 2);
        assert_eq!(step(&mut state, &quota, Timestamp::from_secs(1), 1).remaining(), 1);
        assert_eq!(step(&mut state, &quota, Timestamp::from_secs(2), 1).remaining(), 0);
        assert!(step(&mut state, &quota, Timestamp::from_secs(3), 1).is_denied());
    }

    #[test]
    fn test_rollover_discounts_instant_burst() {
        let quota = quota(100, 60);
        let mut state = None;

        for _ in 0..100 {
            assert!(step(&mut state, &quota, Timestamp::from_secs(0), 1).is_allowed());
        }
        assert!(step(&mut state, &quota, Timestamp::from_secs(0), 1).is_denied());

        // Peek-style probe: nothing from the first window is left.
        let verdict = decide(state.as_ref(), &quota, Timestamp::from_secs(61), 0).verdict;
        assert_eq!(verdict.remaining(), 100);
    }

    #[test]
    fn test_previous_window_decays_linearly() {
        let quota = quota(10, 10);
        let mut state = None;

        // Ten hits spread over [0s, 9s].
        for second in 0..10 {
            assert!(step(&mut state, &quota, Timestamp::from_secs(second), 1).is_allowed());
        }

        // At 13.5s the trailing window starts at 3.5s: 5.5 of 9 seconds overlap.
        // effective = 10 * 5.5 / 9 = 6.1, so 3 more fit.
        let probe = decide(state.as_ref(), &quota, Timestamp::from_millis(13_500), 0).verdict;
        assert_eq!(probe.remaining(), 3);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let quota = quota(5, 1);
        assert!(decide(None, &quota, Timestamp::ZERO, 5).verdict.is_allowed());
    }

    #[test]
    fn test_cost_above_limit_denied_without_mutation() {
        let quota = quota(5, 30);
        let decision = decide(None, &quota, Timestamp::ZERO, 6);
        assert!(decision.state.is_none());
        assert_eq!(
            decision.verdict,
            Verdict::Denied {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_retry_after_waits_for_current_window() {
        let quota = quota(2, 10);
        let mut state = None;

        step(&mut state, &quota, Timestamp::from_secs(0), 1);
        step(&mut state, &quota, Timestamp::from_secs(0), 1);
        let verdict = step(&mut state, &quota, Timestamp::from_secs(4), 1);

        // Both hits landed at 0s and stop counting at 10s.
        assert_eq!(verdict.retry_after(), Some(Duration::from_secs(6)));
        assert!(step(&mut state, &quota, Timestamp::from_secs(10), 1).is_allowed());
    }

    #[test]
    fn test_retry_after_is_honest() {
        let quota = quota(4, 8);
        let mut state = None;

        for second in 0..4 {
            step(&mut state, &quota, Timestamp::from_secs(second * 2), 1);
        }
        let now = Timestamp::from_millis(9_000);
        let verdict = step(&mut state, &quota, now, 3);
        let retry_after = verdict.retry_after().unwrap();

        assert!(decide(state.as_ref(), &quota, now + retry_after, 3).verdict.is_allowed());
        let just_before = now + (retry_after - Duration::from_millis(1));
        assert!(decide(state.as_ref(), &quota, just_before, 3).verdict.is_denied());
    }

    #[test]
    fn test_clock_skew_clamps() {
        let quota = quota(2, 10);
        let mut state = None;
        step(&mut state, &quota, Timestamp::from_secs(50), 1);

        let decision = decide(state.as_ref(), &quota, Timestamp::from_secs(20), 1);
        assert!(decision.verdict.is_allowed());
        assert_eq!(decision.state.unwrap().last_updated(), Timestamp::from_secs(50));
    }
}
