//! Quota definitions and fixed-point rate arithmetic.
//!
//! Token and queue levels are kept as integer "ticks": one unit of budget is
//! `TICKS_PER_UNIT` ticks and the refill rate is held as whole ticks per
//! nanosecond. `TICKS_PER_UNIT` is a multiple of every [`TimeUnit`] in
//! nanoseconds, so any `N per unit` quota earns a whole number of ticks each
//! nanosecond. `elapsed_nanos * ticks_per_nano` is then the exact number of
//! ticks earned, and refills never accumulate rounding drift no matter how
//! often a key is checked.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Ticks per nanosecond at a rate of one unit per second: 86400 * lcm(30, 365).
const TICKS_PER_NANO_AT_ONE_PER_SEC: u128 = 86_400 * 2_190;

/// Ticks in one unit of budget.
pub const TICKS_PER_UNIT: u128 = TICKS_PER_NANO_AT_ONE_PER_SEC * NANOS_PER_SEC;

/// Time unit for per-unit quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    /// Thirty days.
    Month,
    /// 365 days.
    Year,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86_400),
            TimeUnit::Month => Duration::from_secs(86_400 * 30),
            TimeUnit::Year => Duration::from_secs(86_400 * 365),
        }
    }
}

/// An immutable budget: how much may be spent, how fast it comes back, and
/// over which window it is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    capacity: u64,
    burst: u64,
    ticks_per_nano: u128,
    window: Duration,
}

impl Quota {
    /// Create a quota of `capacity` units refilling at `refill_rate_per_second`.
    ///
    /// The sliding window length defaults to the time a full refill takes,
    /// `capacity / refill_rate_per_second`.
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Result<Self> {
        if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
            return Err(LimiterError::invalid(format!(
                "refill rate must be a positive number, got {}",
                refill_rate_per_second
            )));
        }

        let ticks_per_nano =
            (refill_rate_per_second * TICKS_PER_NANO_AT_ONE_PER_SEC as f64).round();
        if ticks_per_nano < 1.0 || ticks_per_nano > u64::MAX as f64 {
            return Err(LimiterError::invalid(format!(
                "refill rate {} is outside the supported range",
                refill_rate_per_second
            )));
        }

        Self::from_ticks_per_nano(capacity, ticks_per_nano as u128)
    }

    /// `requests` per `unit`: capacity `requests`, refilled evenly over one unit,
    /// counted in windows one unit long. The rate is exact for every unit.
    pub fn per_unit(requests: u64, unit: TimeUnit) -> Result<Self> {
        let period = unit.duration().as_nanos();
        let ticks_per_nano = u128::from(requests) * (TICKS_PER_UNIT / period);
        if ticks_per_nano == 0 {
            return Err(LimiterError::invalid("capacity must be greater than zero"));
        }
        Self::from_ticks_per_nano(requests, ticks_per_nano)?.with_window(unit.duration())
    }

    fn from_ticks_per_nano(capacity: u64, ticks_per_nano: u128) -> Result<Self> {
        if capacity == 0 {
            return Err(LimiterError::invalid("capacity must be greater than zero"));
        }

        let window = duration_for_ticks(u128::from(capacity) * TICKS_PER_UNIT, ticks_per_nano);
        if window.is_zero() {
            return Err(LimiterError::invalid("derived window length is zero"));
        }

        Ok(Self {
            capacity,
            burst: 0,
            ticks_per_nano,
            window,
        })
    }

    /// Override the sliding window length.
    pub fn with_window(mut self, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(LimiterError::invalid("window length must be greater than zero"));
        }
        if window.as_nanos() > u128::from(u64::MAX) {
            return Err(LimiterError::invalid("window length is too large"));
        }
        self.window = window;
        Ok(self)
    }

    /// Allow `burst` units on top of the steady capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Largest amount that can ever be held or admitted at once.
    pub fn limit(&self) -> u64 {
        self.capacity.saturating_add(self.burst)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.ticks_per_nano as f64 / TICKS_PER_NANO_AT_ONE_PER_SEC as f64
    }

    pub(crate) fn limit_ticks(&self) -> u128 {
        u128::from(self.limit()) * TICKS_PER_UNIT
    }

    /// Ticks earned (or leaked) over `elapsed`.
    pub(crate) fn ticks_over(&self, elapsed: Duration) -> u128 {
        elapsed.as_nanos().saturating_mul(self.ticks_per_nano)
    }

    /// Time needed to earn (or leak) `ticks`, rounded up to the next nanosecond.
    pub(crate) fn time_for_ticks(&self, ticks: u128) -> Duration {
        duration_for_ticks(ticks, self.ticks_per_nano)
    }

    /// How long a key must sit idle before its state is indistinguishable
    /// from no state at all: a full refill or a full window, whichever is longer.
    pub fn idle_retention(&self) -> Duration {
        self.window.max(self.time_for_ticks(self.limit_ticks()))
    }

    /// Time needed to earn one unit.
    pub fn time_per_unit(&self) -> Duration {
        self.time_for_ticks(TICKS_PER_UNIT)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{} @ {}/s (window {:?})",
            self.capacity,
            self.burst,
            self.refill_rate_per_second(),
            self.window
        )
    }
}

fn duration_for_ticks(ticks: u128, ticks_per_nano: u128) -> Duration {
    let nanos = ticks.div_ceil(ticks_per_nano);
    let secs = nanos / NANOS_PER_SEC;
    if secs > u128::from(u64::MAX) {
        return Duration::MAX;
    }
    Duration::new(secs as u64, (nanos % NANOS_PER_SEC) as u32)
}

/// Convert ticks to whole units, rounding down.
pub(crate) fn whole_units(ticks: u128) -> u64 {
    u64::try_from(ticks / TICKS_PER_UNIT).unwrap_or(u64::MAX)
}
