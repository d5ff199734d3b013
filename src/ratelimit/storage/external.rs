//! Shared-store backend.
//!
//! Any key-value store that offers a versioned conditional write can hold
//! limiter state for several processes at once. The contract is two calls:
//!
//! ```text
//! GET key                            -> (version, value) | missing
//! CAS key expected_version new_value -> OK(version) | VersionConflict | NotFound
//! ```
//!
//! [`VersionedStore`] is that contract; [`ExternalStore`] adapts it to
//! [`StorageBackend`] by encoding state as JSON and keeping an optional local
//! snapshot cache in front of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CasOutcome, Snapshot, StorageBackend, StorageError};
use crate::ratelimit::key::Key;
use crate::ratelimit::state::LimiterState;

/// A value stored under a key, with the version that identifies this write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Reply to a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasReply {
    Ok { version: u64 },
    VersionConflict,
    NotFound,
}

/// The conditional-write protocol a shared store must speak.
///
/// `cas` with `expected = None` creates the key and replies `VersionConflict`
/// if it already exists. With `Some(version)` it replies `NotFound` when the
/// key is gone and `VersionConflict` when the version moved on. Versions must
/// never be reused for a key, even across deletes.
#[async_trait]
pub trait VersionedStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError>;

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasReply, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process implementation of the [`VersionedStore`] protocol.
///
/// Useful as a stand-in for a real shared store in tests, and for running
/// several limiters in one process against common state.
#[derive(Debug, Default)]
pub struct LocalVersionedStore {
    values: DashMap<String, VersionedValue>,
    versions: AtomicU64,
}

impl LocalVersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl VersionedStore for LocalVersionedStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasReply, StorageError> {
        let reply = match (self.values.entry(key.to_string()), expected) {
            (Entry::Vacant(_), Some(_)) => CasReply::NotFound,
            (Entry::Occupied(_), None) => CasReply::VersionConflict,
            (Entry::Occupied(occupied), Some(version)) if occupied.get().version != version => {
                CasReply::VersionConflict
            }
            (Entry::Occupied(mut occupied), Some(_)) => {
                let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
                occupied.insert(VersionedValue { version, value });
                CasReply::Ok { version }
            }
            (Entry::Vacant(vacant), None) => {
                let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
                vacant.insert(VersionedValue { version, value });
                CasReply::Ok { version }
            }
        };
        Ok(reply)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}

struct CachedSnapshot {
    snapshot: Snapshot,
    fetched_at: Instant,
    touched: u64,
}

/// Local LRU cache of snapshots read from the shared store.
struct SnapshotCache {
    entries: HashMap<Key, CachedSnapshot>,
    capacity: usize,
    ttl: Duration,
    access_counter: u64,
}

impl SnapshotCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
            access_counter: 0,
        }
    }

    fn get(&mut self, key: &Key) -> Option<Snapshot> {
        let ttl = self.ttl;
        self.access_counter += 1;
        let counter = self.access_counter;

        let entry = self.entries.get_mut(key)?;
        if entry.fetched_at.elapsed() >= ttl {
            self.entries.remove(key);
            return None;
        }
        entry.touched = counter;
        Some(entry.snapshot.clone())
    }

    fn insert(&mut self, key: Key, snapshot: Snapshot) {
        // A slow reader must not replace a newer write.
        if let Some(existing) = self.entries.get(&key) {
            if existing.snapshot.version > snapshot.version {
                return;
            }
        } else if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.access_counter += 1;
        self.entries.insert(
            key,
            CachedSnapshot {
                snapshot,
                fetched_at: Instant::now(),
                touched: self.access_counter,
            },
        );
    }

    fn invalidate(&mut self, key: &Key) {
        self.entries.remove(key);
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&victim);
        }
    }
}

/// [`StorageBackend`] over a shared [`VersionedStore`].
///
/// With a non-zero `staleness`, reads may be answered from a local snapshot
/// cache for that long. A cached snapshot is only a starting point: the swap
/// still presents its version, so a stale entry produces a conflict, is
/// dropped from the cache, and the next attempt reads through to the store.
/// The cache never deletes shared state.
pub struct ExternalStore<S> {
    store: S,
    cache: Option<Mutex<SnapshotCache>>,
}

impl<S: VersionedStore> ExternalStore<S> {
    /// Wrap `store` with no local caching.
    pub fn new(store: S) -> Self {
        Self { store, cache: None }
    }

    /// Cache up to `capacity` snapshots locally, each for at most `staleness`.
    pub fn with_cache(store: S, capacity: usize, staleness: Duration) -> Self {
        let cache = (!staleness.is_zero()).then(|| Mutex::new(SnapshotCache::new(capacity, staleness)));
        Self { store, cache }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }

    fn remember(&self, key: &Key, snapshot: &Snapshot) {
        if let Some(cache) = &self.cache {
            cache.lock().insert(key.clone(), snapshot.clone());
        }
    }

    fn forget(&self, key: &Key) {
        if let Some(cache) = &self.cache {
            cache.lock().invalidate(key);
        }
    }
}

impl<S: VersionedStore> fmt::Debug for ExternalStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalStore")
            .field("store", &self.store)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[async_trait]
impl<S: VersionedStore> StorageBackend for ExternalStore<S> {
    async fn get(&self, key: &Key) -> Result<Option<Snapshot>, StorageError> {
        if let Some(cache) = &self.cache {
            if let Some(snapshot) = cache.lock().get(key) {
                trace!(key = %key, version = snapshot.version, "Snapshot cache hit");
                return Ok(Some(snapshot));
            }
        }

        let Some(stored) = self.store.get(key.as_str()).await? else {
            self.forget(key);
            return Ok(None);
        };

        let snapshot = Snapshot {
            state: serde_json::from_slice(&stored.value)?,
            version: stored.version,
        };
        self.remember(key, &snapshot);
        Ok(Some(snapshot))
    }

    async fn compare_and_swap(
        &self,
        key: &Key,
        expected: Option<u64>,
        state: &LimiterState,
    ) -> Result<CasOutcome, StorageError> {
        let value = serde_json::to_vec(state)?;

        match self.store.cas(key.as_str(), expected, value).await {
            Ok(CasReply::Ok { version }) => {
                self.remember(
                    key,
                    &Snapshot {
                        state: state.clone(),
                        version,
                    },
                );
                Ok(CasOutcome::Success(version))
            }
            Ok(reply) => {
                debug!(key = %key, ?expected, ?reply, "Shared store rejected conditional write");
                self.forget(key);
                Ok(CasOutcome::Conflict)
            }
            Err(e) => {
                // The write may or may not have landed; re-read next time.
                self.forget(key);
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &Key) -> Result<(), StorageError> {
        self.forget(key);
        self.store.delete(key.as_str()).await
    }

    fn name(&self) -> &'static str {
        "external"
    }
}
