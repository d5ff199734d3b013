//! Decision events for observability.
//!
//! The limiter reports every decision to a [`DecisionObserver`]. What happens
//! with the event (logs, metrics, an audit stream) is up to the embedder.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use super::key::Key;
use super::state::Verdict;

/// One admission decision, as seen from outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub key: Key,
    pub cost: u64,
    pub verdict: Verdict,
    pub remaining: u64,
    /// Wall time spent inside the limiter, storage calls included.
    pub latency: Duration,
    /// Read-decide-swap attempts started, counting the one that failed, if any.
    pub attempts: u32,
    /// The verdict came from the fallback policy, not from stored state.
    pub degraded: bool,
}

/// Receives decision events. Implementations must be cheap and non-blocking;
/// they run inline on the request path.
pub trait DecisionObserver: Send + Sync + fmt::Debug {
    fn on_decision(&self, event: &DecisionEvent);
}

/// Observer that emits each decision as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DecisionObserver for TracingObserver {
    fn on_decision(&self, event: &DecisionEvent) {
        debug!(
            key = %event.key,
            cost = event.cost,
            allowed = event.verdict.is_allowed(),
            remaining = event.remaining,
            retry_after_ms = event.verdict.retry_after().map(|d| d.as_millis() as u64),
            latency_us = event.latency.as_micros() as u64,
            attempts = event.attempts,
            degraded = event.degraded,
            "Rate limit decision"
        );
    }
}

/// Observer that discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DecisionObserver for NoopObserver {
    fn on_decision(&self, _event: &DecisionEvent) {}
}
