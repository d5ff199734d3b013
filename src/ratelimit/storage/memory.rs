//! In-process storage backed by a sharded concurrent map.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CasOutcome, Snapshot, StorageBackend, StorageError};
use crate::ratelimit::key::Key;
use crate::ratelimit::state::LimiterState;

/// Default bound on the number of keys held in memory.
pub const DEFAULT_MAX_KEYS: usize = 10_000;

struct Slot {
    snapshot: Snapshot,
    /// Access tick for LRU eviction.
    touched: AtomicU64,
}

/// State store living in this process.
///
/// Keys are spread over the shards of a [`DashMap`]; a compare-and-swap holds
/// the shard's write lock for the duration of the version check and write, so
/// it is atomic against every other call on the same key.
///
/// The store holds at most `max_keys` entries. Past that, the least recently
/// used key is dropped, which resets it to a fresh budget on its next check.
pub struct MemoryStore {
    slots: DashMap<Key, Slot>,
    max_keys: usize,
    clock: AtomicU64,
    versions: AtomicU64,
}

impl MemoryStore {
    /// Create a store with the default key bound.
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_keys: max_keys.max(1),
            clock: AtomicU64::new(0),
            versions: AtomicU64::new(0),
        }
    }

    /// Get the number of keys with state.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Evict least recently used keys until the bound holds again.
    ///
    /// Must not be called while holding a guard into `slots`.
    fn evict_overflow(&self, keep: &Key) {
        while self.slots.len() > self.max_keys {
            let victim = self
                .slots
                .iter()
                .filter(|slot| slot.key() != keep)
                .min_by_key(|slot| slot.value().touched.load(Ordering::Relaxed))
                .map(|slot| (slot.key().clone(), slot.value().touched.load(Ordering::Relaxed)));

            let Some((victim, touched)) = victim else {
                return;
            };

            // Skip the removal if the key was used after we picked it.
            let removed = self
                .slots
                .remove_if(&victim, |_, slot| slot.touched.load(Ordering::Relaxed) == touched);
            if removed.is_some() {
                debug!(key = %victim, "Evicted least recently used key");
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.slots.len())
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn get(&self, key: &Key) -> Result<Option<Snapshot>, StorageError> {
        let tick = self.tick();
        Ok(self.slots.get(key).map(|slot| {
            slot.touched.store(tick, Ordering::Relaxed);
            slot.snapshot.clone()
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &Key,
        expected: Option<u64>,
        state: &LimiterState,
    ) -> Result<CasOutcome, StorageError> {
        let tick = self.tick();

        let (outcome, inserted) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match expected {
                Some(version) if occupied.get().snapshot.version == version => {
                    let version = self.next_version();
                    let slot = occupied.get_mut();
                    slot.snapshot = Snapshot {
                        state: state.clone(),
                        version,
                    };
                    slot.touched.store(tick, Ordering::Relaxed);
                    (CasOutcome::Success(version), false)
                }
                _ => (CasOutcome::Conflict, false),
            },
            Entry::Vacant(vacant) => match expected {
                None => {
                    let version = self.next_version();
                    vacant.insert(Slot {
                        snapshot: Snapshot {
                            state: state.clone(),
                            version,
                        },
                        touched: AtomicU64::new(tick),
                    });
                    (CasOutcome::Success(version), true)
                }
                Some(_) => (CasOutcome::Conflict, false),
            },
        };

        trace!(key = %key, ?expected, ?outcome, "Memory compare-and-swap");

        if inserted {
            self.evict_overflow(key);
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &Key) -> Result<(), StorageError> {
        self.slots.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::Timestamp;
    use std::sync::Arc;

    fn state(tokens: u64) -> LimiterState {
        LimiterState::token_bucket(tokens, Timestamp::ZERO)
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert!(store.get(&Key::new("nobody")).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_create_then_swap() {
        let store = MemoryStore::new();
        let key = Key::new("user:1");

        let CasOutcome::Success(v1) = store.compare_and_swap(&key, None, &state(5)).await.unwrap()
        else {
            panic!("create should succeed");
        };

        // Creating again must conflict.
        assert_eq!(
            store.compare_and_swap(&key, None, &state(4)).await.unwrap(),
            CasOutcome::Conflict
        );

        let outcome = store.compare_and_swap(&key, Some(v1), &state(4)).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Success(v2) if v2 > v1));

        // The old version is now stale.
        assert_eq!(
            store.compare_and_swap(&key, Some(v1), &state(3)).await.unwrap(),
            CasOutcome::Conflict
        );

        let snapshot = store.get(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.state, state(4));
    }

    #[tokio::test]
    async fn test_swap_on_missing_key_conflicts() {
        let store = MemoryStore::new();
        let outcome = store
            .compare_and_swap(&Key::new("ghost"), Some(1), &state(1))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_versions_never_repeat_after_delete() {
        let store = MemoryStore::new();
        let key = Key::new("k");

        let CasOutcome::Success(first) = store.compare_and_swap(&key, None, &state(1)).await.unwrap()
        else {
            panic!("create should succeed");
        };
        store.delete(&key).await.unwrap();
        let CasOutcome::Success(second) = store.compare_and_swap(&key, None, &state(1)).await.unwrap()
        else {
            panic!("create should succeed");
        };

        assert_ne!(first, second);
        assert_eq!(
            store.compare_and_swap(&key, Some(first), &state(0)).await.unwrap(),
            CasOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = MemoryStore::with_max_keys(2);
        let (a, b, c) = (Key::new("a"), Key::new("b"), Key::new("c"));

        store.compare_and_swap(&a, None, &state(1)).await.unwrap();
        store.compare_and_swap(&b, None, &state(1)).await.unwrap();
        // Touch `a` so `b` becomes the eviction candidate.
        store.get(&a).await.unwrap();
        store.compare_and_swap(&c, None, &state(1)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&b).await.unwrap().is_none());
        assert!(store.get(&c).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let key = Key::new("contended");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.compare_and_swap(&key, None, &state(1)).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if let CasOutcome::Success(_) = task.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
