//! The closed set of admission algorithms.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::quota::Quota;
use super::state::{Decision, LimiterState, Verdict};
use super::{leaky_bucket, sliding_window, token_bucket};

/// Admission algorithm, selected once at configuration time.
///
/// Every variant is a pure function of `(state, quota, now, cost)`; none of
/// them perform I/O or read the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[serde(alias = "tokenBucket")]
    TokenBucket,
    #[serde(alias = "slidingWindow")]
    SlidingWindow,
    #[serde(alias = "leakyBucket")]
    LeakyBucket,
}

impl Algorithm {
    /// Decide on a request of `cost` units against `state` at `now`.
    pub fn decide(
        &self,
        state: Option<&LimiterState>,
        quota: &Quota,
        now: Timestamp,
        cost: u64,
    ) -> Decision {
        match self {
            Algorithm::TokenBucket => token_bucket::decide(state, quota, now, cost),
            Algorithm::SlidingWindow => sliding_window::decide(state, quota, now, cost),
            Algorithm::LeakyBucket => leaky_bucket::decide(state, quota, now, cost),
        }
    }

    /// Report what a single-unit request would see, without spending anything.
    ///
    /// `Allowed` carries the budget currently available; `Denied` carries the
    /// wait until one unit fits.
    pub fn inspect(&self, state: Option<&LimiterState>, quota: &Quota, now: Timestamp) -> Verdict {
        let probe = self.decide(state, quota, now, 0).verdict;
        if probe.remaining() >= 1 {
            probe
        } else {
            self.decide(state, quota, now, 1).verdict
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
