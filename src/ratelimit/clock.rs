//! Time sources for the engine.
//!
//! Strategies never read the time themselves; the limiter asks a [`Clock`] once
//! per decision and passes the result down. Tests swap in [`ManualClock`] to
//! step through refills and window rollovers without sleeping.

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_MILLI: u64 = 1_000_000;

/// A point in time, in nanoseconds since the Unix epoch.
///
/// Timestamps are stored alongside per-key state in shared stores, so they are
/// wall-clock based rather than process-local `Instant`s.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(NANOS_PER_MILLI))
    }

    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000_000))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Time elapsed since `earlier`, clamped to zero when `earlier` is in the future.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Duration from `self` until `later`, zero if `later` has already passed.
    pub fn until(self, later: Timestamp) -> Duration {
        later.elapsed_since(self)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let nanos = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// Resolution of timestamps produced by [`SystemClock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Millis,
    #[default]
    Nanos,
}

impl Precision {
    fn truncate(self, nanos: u64) -> u64 {
        match self {
            Precision::Millis => nanos - nanos % NANOS_PER_MILLI,
            Precision::Nanos => nanos,
        }
    }
}

/// Supplies the current time to the limiter.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock that never goes backwards within one process.
///
/// Readings are clamped against the highest value handed out so far, so a
/// backward NTP step shows up as time standing still rather than reversing.
#[derive(Debug, Default)]
pub struct SystemClock {
    precision: Precision,
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_precision(precision: Precision) -> Self {
        Self {
            precision,
            last: AtomicU64::new(0),
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or(u64::MAX);
        let wall = self.precision.truncate(wall);
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        Timestamp(previous.max(wall))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to the limiter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start.as_nanos())),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let step = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(step)));
    }

    /// Jump to an arbitrary instant, including one in the past.
    pub fn set(&self, to: Timestamp) {
        self.nanos.store(to.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(Timestamp::from_secs(10));
        let handle = clock.clone();

        handle.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timestamp::from_millis(11_500));

        handle.set(Timestamp::from_secs(3));
        assert_eq!(clock.now(), Timestamp::from_secs(3));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn test_system_clock_millis_precision() {
        let clock = SystemClock::with_precision(Precision::Millis);
        assert_eq!(clock.now().as_nanos() % NANOS_PER_MILLI, 0);
    }

    #[test]
    fn test_elapsed_clamps_backwards_time() {
        let early = Timestamp::from_secs(5);
        let late = Timestamp::from_secs(7);
        assert_eq!(late.elapsed_since(early), Duration::from_secs(2));
        assert_eq!(early.elapsed_since(late), Duration::ZERO);
        assert_eq!(early.until(late), Duration::from_secs(2));
    }

    #[test]
    fn test_timestamp_add_saturates() {
        let ts = Timestamp::from_nanos(u64::MAX - 1);
        assert_eq!(ts + Duration::from_secs(1), Timestamp::from_nanos(u64::MAX));
    }
}
