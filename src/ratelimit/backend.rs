//! Admission trait for abstracting single and composite limiters.

use async_trait::async_trait;

use super::key::Key;
use super::state::Verdict;
use crate::error::Result;

/// Something that can admit or reject work for a key.
///
/// This trait abstracts over both [`Limiter`](super::Limiter) and
/// [`CompositeLimiter`](super::CompositeLimiter) so callers such as the CLI
/// can work with either.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Spend `cost` units for `key`.
    async fn check(&self, key: &Key, cost: u64) -> Result<Verdict>;

    /// Report what a single-unit check would see, without spending.
    async fn peek(&self, key: &Key) -> Result<Verdict>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &Key) -> Result<()>;
}
