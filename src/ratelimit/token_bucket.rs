//! Token bucket strategy.
//!
//! The bucket starts full at the quota limit and earns tokens continuously at
//! the refill rate. A request spending `cost` is admitted while at least
//! `cost` tokens are held, so bursts up to the limit pass immediately and the
//! sustained rate is bounded by the refill rate.

use tracing::debug;

use super::clock::Timestamp;
use super::quota::{whole_units, Quota, TICKS_PER_UNIT};
use super::state::{Decision, LimiterState, Verdict};

/// Decide on a request of `cost` units at `now`.
///
/// A missing state, or one written by another algorithm, is treated as a
/// full bucket. Denials leave the stored state untouched: the refill is a
/// pure function of elapsed time and is recomputed on the next call.
pub fn decide(state: Option<&LimiterState>, quota: &Quota, now: Timestamp, cost: u64) -> Decision {
    let limit = quota.limit_ticks();

    let (tokens, last_refill_at) = match state {
        Some(LimiterState::TokenBucket {
            tokens,
            last_refill_at,
        }) => ((*tokens).min(limit), *last_refill_at),
        _ => (limit, now),
    };

    if now < last_refill_at {
        debug!(
            now = %now,
            last_refill_at = %last_refill_at,
            "Clock moved backwards; treating elapsed time as zero"
        );
    }
    let now = now.max(last_refill_at);

    let tokens = tokens
        .saturating_add(quota.ticks_over(now.elapsed_since(last_refill_at)))
        .min(limit);
    let cost = u128::from(cost) * TICKS_PER_UNIT;

    if tokens >= cost {
        let left = tokens - cost;
        let verdict = Verdict::Allowed {
            remaining: whole_units(left),
            reset_at: now + quota.time_for_ticks(limit - left),
        };
        let state = LimiterState::TokenBucket {
            tokens: left,
            last_refill_at: now,
        };
        Decision::update(state, verdict)
    } else {
        Decision::unchanged(Verdict::Denied {
            retry_after: quota.time_for_ticks(cost - tokens),
        })
    }
}
