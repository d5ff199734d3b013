//! End-to-end behaviour of the limiter across algorithms and backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use quotaguard::error::LimiterError;
use quotaguard::ratelimit::storage::{
    CasOutcome, ExternalStore, LocalVersionedStore, MemoryStore, Snapshot, StorageError,
};
use quotaguard::ratelimit::{
    Algorithm, FallbackPolicy, Key, Limiter, LimiterState, ManualClock, Quota, StorageBackend,
    Timestamp, Verdict,
};

const ALGORITHMS: [Algorithm; 3] = [
    Algorithm::TokenBucket,
    Algorithm::SlidingWindow,
    Algorithm::LeakyBucket,
];

fn limiter(
    algorithm: Algorithm,
    quota: Quota,
    storage: Arc<dyn StorageBackend>,
    clock: &ManualClock,
) -> Limiter {
    Limiter::builder(algorithm, quota, FallbackPolicy::FailClosed)
        .storage(storage)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

#[derive(Debug)]
struct UnavailableStore;

#[async_trait]
impl StorageBackend for UnavailableStore {
    async fn get(&self, _key: &Key) -> Result<Option<Snapshot>, StorageError> {
        Err(StorageError::Unavailable("store is down".into()))
    }

    async fn compare_and_swap(
        &self,
        _key: &Key,
        _expected: Option<u64>,
        _state: &LimiterState,
    ) -> Result<CasOutcome, StorageError> {
        Err(StorageError::Unavailable("store is down".into()))
    }

    async fn delete(&self, _key: &Key) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("store is down".into()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[tokio::test]
async fn burst_plus_sustained_bound() {
    let clock = ManualClock::new(Timestamp::ZERO);
    let quota = Quota::new(10, 5.0).unwrap();
    let limiter = limiter(
        Algorithm::TokenBucket,
        quota,
        Arc::new(MemoryStore::new()),
        &clock,
    );
    let key = Key::new("bounded");

    // Hammer the key three times every 100ms for 10 seconds.
    let mut admitted = Vec::new();
    for step in 0..100u64 {
        for _ in 0..3 {
            if limiter.check(&key).await.unwrap().is_allowed() {
                admitted.push(step * 100);
            }
        }
        clock.advance(Duration::from_millis(100));
    }

    let window_ms = 2_000;
    let bound = 10 + 5 * 2;
    for &start in &admitted {
        let in_window = admitted
            .iter()
            .filter(|&&t| t >= start && t <= start + window_ms)
            .count();
        assert!(in_window <= bound, "{} admitted in window at {}ms", in_window, start);
    }
    assert_eq!(admitted.len(), 10 + 5 * 10 - 1);
}

#[tokio::test]
async fn peek_is_idempotent_for_every_algorithm() {
    for algorithm in ALGORITHMS {
        let clock = ManualClock::new(Timestamp::from_secs(100));
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(algorithm, Quota::new(5, 1.0).unwrap(), store.clone(), &clock);
        let key = Key::new("peek");

        limiter.check_cost(&key, 4).await.unwrap();
        let stored = store.get(&key).await.unwrap();
        let first = limiter.peek(&key).await.unwrap();

        for _ in 0..5 {
            assert_eq!(limiter.peek(&key).await.unwrap(), first, "{}", algorithm);
        }
        assert_eq!(first.remaining(), 1, "{}", algorithm);
        assert_eq!(store.get(&key).await.unwrap(), stored, "{}", algorithm);
    }
}

#[tokio::test]
async fn boundary_cost_equal_to_capacity() {
    for algorithm in ALGORITHMS {
        let clock = ManualClock::new(Timestamp::ZERO);
        let limiter = limiter(
            algorithm,
            Quota::new(7, 1.0).unwrap(),
            Arc::new(MemoryStore::new()),
            &clock,
        );
        let key = Key::new("boundary");

        assert!(limiter.check_cost(&key, 7).await.unwrap().is_allowed(), "{}", algorithm);

        limiter.reset(&key).await.unwrap();
        assert!(limiter.check_cost(&key, 8).await.unwrap().is_denied(), "{}", algorithm);
        // The oversized request spent nothing.
        assert!(limiter.check_cost(&key, 7).await.unwrap().is_allowed(), "{}", algorithm);
    }
}

async fn run_concurrent(storage: Arc<dyn StorageBackend>, algorithm: Algorithm) {
    const CAPACITY: u64 = 10;
    const CALLERS: usize = 64;

    let clock = ManualClock::new(Timestamp::ZERO);
    // Only admitted checks write, so a caller can lose at most CAPACITY races.
    let limiter = Arc::new(
        Limiter::builder(
            algorithm,
            Quota::new(CAPACITY, 1.0).unwrap(),
            FallbackPolicy::FailClosed,
        )
        .storage(storage)
        .clock(Arc::new(clock))
        .max_attempts(CAPACITY as u32 + 1)
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .build()
        .unwrap(),
    );

    let handles = (0..CALLERS).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.check(&Key::new("shared")).await })
    });

    let verdicts: Vec<Verdict> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let allowed = verdicts.iter().filter(|v| v.is_allowed()).count();
    assert_eq!(allowed, CAPACITY as usize, "{}", algorithm);
    assert_eq!(verdicts.len() - allowed, CALLERS - CAPACITY as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_capacity_in_memory() {
    for algorithm in ALGORITHMS {
        run_concurrent(Arc::new(MemoryStore::new()), algorithm).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_capacity_through_shared_store() {
    for algorithm in ALGORITHMS {
        let store = ExternalStore::with_cache(
            LocalVersionedStore::new(),
            128,
            Duration::from_secs(60),
        );
        run_concurrent(Arc::new(store), algorithm).await;
    }
}

#[tokio::test]
async fn sliding_window_rollover_discounts_old_window() {
    let clock = ManualClock::new(Timestamp::ZERO);
    let quota = Quota::new(100, 100.0 / 60.0)
        .unwrap()
        .with_window(Duration::from_secs(60))
        .unwrap();
    let limiter = limiter(
        Algorithm::SlidingWindow,
        quota,
        Arc::new(MemoryStore::new()),
        &clock,
    );
    let key = Key::new("window");

    for _ in 0..100 {
        assert!(limiter.check(&key).await.unwrap().is_allowed());
    }
    assert!(limiter.check(&key).await.unwrap().is_denied());

    clock.set(Timestamp::from_secs(61));
    assert_eq!(limiter.peek(&key).await.unwrap().remaining(), 100);
    assert!(limiter.check_cost(&key, 100).await.unwrap().is_allowed());
}

#[tokio::test]
async fn fallback_policy_when_storage_is_down() {
    for (policy, expect_allowed) in [
        (FallbackPolicy::FailOpen, true),
        (FallbackPolicy::FailClosed, false),
    ] {
        let limiter = Limiter::builder(
            Algorithm::TokenBucket,
            Quota::new(1, 1.0).unwrap(),
            policy,
        )
        .storage(Arc::new(UnavailableStore))
        .build()
        .unwrap();

        for i in 0..10 {
            let verdict = limiter.check(&Key::new(format!("k{}", i % 2))).await.unwrap();
            assert_eq!(verdict.is_allowed(), expect_allowed, "{:?}", policy);
        }
        assert!(matches!(
            limiter.reset(&Key::new("k0")).await,
            Err(LimiterError::StorageUnavailable(_))
        ));
    }
}

#[tokio::test]
async fn five_per_second_scenario_over_shared_store() {
    let clock = ManualClock::new(Timestamp::ZERO);
    let limiter = limiter(
        Algorithm::TokenBucket,
        Quota::new(5, 1.0).unwrap(),
        Arc::new(ExternalStore::new(LocalVersionedStore::new())),
        &clock,
    );
    let key = Key::composite([("app", "billing"), ("user", "42")]);

    for expected_remaining in (0..5).rev() {
        let verdict = limiter.check(&key).await.unwrap();
        assert_eq!(verdict.remaining(), expected_remaining);
        assert!(verdict.is_allowed());
    }

    let denied = limiter.check(&key).await.unwrap();
    assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));

    clock.advance(Duration::from_secs(1));
    let verdict = limiter.check(&key).await.unwrap();
    assert!(verdict.is_allowed());
    assert_eq!(verdict.remaining(), 0);
}
