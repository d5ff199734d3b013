//! Leaky bucket strategy.
//!
//! Admitted work fills a queue that drains at the refill rate. A request is
//! admitted while the queue has room for its cost, which smooths admitted
//! traffic to the drain rate once the queue is full.

use tracing::debug;

use super::clock::Timestamp;
use super::quota::{whole_units, Quota, TICKS_PER_UNIT};
use super::state::{Decision, LimiterState, Verdict};

/// Decide on a request of `cost` units at `now`.
///
/// A missing state, or one written by another algorithm, is an empty queue.
pub fn decide(state: Option<&LimiterState>, quota: &Quota, now: Timestamp, cost: u64) -> Decision {
    let limit = quota.limit_ticks();

    let (level, last_leak_at) = match state {
        Some(LimiterState::LeakyBucket {
            level,
            last_leak_at,
        }) => ((*level).min(limit), *last_leak_at),
        _ => (0, now),
    };

    if now < last_leak_at {
        debug!(
            now = %now,
            last_leak_at = %last_leak_at,
            "Clock moved backwards; treating elapsed time as zero"
        );
    }
    let now = now.max(last_leak_at);

    let level = level.saturating_sub(quota.ticks_over(now.elapsed_since(last_leak_at)));
    let cost = u128::from(cost) * TICKS_PER_UNIT;
    let filled = level.saturating_add(cost);

    if filled <= limit {
        let verdict = Verdict::Allowed {
            remaining: whole_units(limit - filled),
            reset_at: now + quota.time_for_ticks(filled),
        };
        let state = LimiterState::LeakyBucket {
            level: filled,
            last_leak_at: now,
        };
        Decision::update(state, verdict)
    } else {
        Decision::unchanged(Verdict::Denied {
            retry_after: quota.time_for_ticks(filled - limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn step(state: &mut Option<LimiterState>, quota: &Quota, now: Timestamp, cost: u64) -> Verdict {
        let decision = decide(state.as_ref(), quota, now, cost);
        if let Some(next) = decision.state {
            *state = Some(next);
        }
        decision.verdict
    }

    #[test]
    fn test_fills_then_denies() {
        let quota = Quota::new(3, 1.0).unwrap();
        let mut state = None;

        assert_eq!(step(&mut state, &quota, Timestamp::ZERO, 1).remaining(), 2);
        assert_eq!(step(&mut state, &quota, Timestamp::ZERO, 2).remaining(), 0);
        assert_eq!(state.as_ref().unwrap().queue_level(), Some(3));

        let verdict = step(&mut state, &quota, Timestamp::ZERO, 1);
        assert_eq!(verdict.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_leaks_over_time() {
        let quota = Quota::new(4, 2.0).unwrap();
        let state = LimiterState::leaky_bucket(4, Timestamp::ZERO);

        // 1.5s drains three units.
        let decision = decide(Some(&state), &quota, Timestamp::from_millis(1500), 3);
        assert!(decision.verdict.is_allowed());
        assert_eq!(decision.verdict.remaining(), 0);

        // Level never goes below zero however long the gap.
        let decision = decide(Some(&state), &quota, Timestamp::from_secs(3600), 0);
        assert_eq!(decision.verdict.remaining(), 4);
        assert_eq!(decision.state.unwrap().queue_level(), Some(0));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let quota = Quota::new(5, 1.0).unwrap();
        assert!(decide(None, &quota, Timestamp::ZERO, 5).verdict.is_allowed());

        let decision = decide(None, &quota, Timestamp::ZERO, 6);
        assert!(decision.state.is_none());
        assert_eq!(decision.verdict.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_smooths_to_drain_rate() {
        let quota = Quota::new(2, 10.0).unwrap();
        let mut state = None;
        let mut allowed = 0;

        // One second of requests every millisecond.
        for ms in 0..1000 {
            if step(&mut state, &quota, Timestamp::from_millis(ms), 1).is_allowed() {
                allowed += 1;
            }
        }

        // Initial room of two plus ten drained per second.
        assert!((11..=12).contains(&allowed), "admitted {}", allowed);
    }

    #[test]
    fn test_reset_at_is_drain_time() {
        let quota = Quota::new(10, 4.0).unwrap();
        let verdict = decide(None, &quota, Timestamp::from_secs(1), 2).verdict;
        assert_eq!(
            verdict,
            Verdict::Allowed {
                remaining: 8,
                reset_at: Timestamp::from_millis(1500),
            }
        );
    }
}
