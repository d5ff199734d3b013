//! Storage backends for per-key limiter state.
//!
//! A backend owns the canonical copy of each key's [`LimiterState`] and
//! exposes one mutation primitive: a versioned compare-and-swap. The limiter
//! never writes state unconditionally, so concurrent checks on one key are
//! serialized by whichever swap lands first.

mod external;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use external::{CasReply, ExternalStore, LocalVersionedStore, VersionedStore, VersionedValue};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::key::Key;
use super::state::LimiterState;

/// Errors a backend can report. Conflicts are not errors; see [`CasOutcome`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to decode stored state: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A stored state together with the version that must be presented to replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: LimiterState,
    pub version: u64,
}

/// Result of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the key now carries this version.
    Success(u64),
    /// Someone else wrote (or deleted) the key since it was read.
    Conflict,
}

/// Which backend a limiter is configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    External,
}

/// Trait for storage backend implementations.
///
/// `compare_and_swap` must be atomic with respect to every other call on the
/// same key. `expected = None` means "only if the key does not exist".
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Read the current state of `key`, if any.
    async fn get(&self, key: &Key) -> Result<Option<Snapshot>, StorageError>;

    /// Replace the state of `key` if its version still equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &Key,
        expected: Option<u64>,
        state: &LimiterState,
    ) -> Result<CasOutcome, StorageError>;

    /// Remove all state for `key`.
    async fn delete(&self, key: &Key) -> Result<(), StorageError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
