//! Core rate limiter implementation.
//!
//! [`Limiter`] ties the pieces together: it resolves a key's quota, reads the
//! key's state from the storage backend, runs the configured algorithm, and
//! writes the result back with a compare-and-swap. A lost race means another
//! request changed the key first, so the whole read-decide-swap cycle starts
//! over on fresh state, up to a fixed number of attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::algorithm::Algorithm;
use super::backend::AdmissionControl;
use super::clock::{Clock, SystemClock};
use super::key::Key;
use super::observer::{DecisionEvent, DecisionObserver, TracingObserver};
use super::quota::Quota;
use super::rules::QuotaResolver;
use super::state::Verdict;
use super::storage::{BackendKind, CasOutcome, MemoryStore, StorageBackend, StorageError};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};

/// Default number of read-decide-swap attempts per check.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default deadline for a single storage call.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(50);

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(20);

/// What to answer when the storage backend cannot be reached.
///
/// There is deliberately no default: admitting traffic during an outage and
/// refusing it are both valid, and the choice belongs to the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Admit the request.
    #[serde(alias = "failOpen")]
    FailOpen,
    /// Reject the request.
    #[serde(alias = "failClosed")]
    FailClosed,
}

/// Why a check could not be answered from storage.
enum Failure {
    Storage { error: StorageError, attempts: u32 },
    Contention { attempts: u32 },
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder {
    algorithm: Algorithm,
    resolver: QuotaResolver,
    fallback: FallbackPolicy,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    observer: Option<Arc<dyn DecisionObserver>>,
    storage_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl LimiterBuilder {
    /// Every key gets `quota` unless rules are installed with [`Self::resolver`].
    pub fn new(algorithm: Algorithm, quota: Quota, fallback: FallbackPolicy) -> Self {
        Self {
            algorithm,
            resolver: QuotaResolver::new(quota),
            fallback,
            storage: None,
            clock: None,
            observer: None,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    pub fn resolver(mut self, resolver: QuotaResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Defaults to a [`MemoryStore`].
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Defaults to a [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a [`TracingObserver`].
    pub fn observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    /// Upper bound on read-decide-swap attempts for one check.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sleep between conflicting attempts: exponential from `base`, capped at `max`.
    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn build(self) -> Result<Limiter> {
        if self.storage_timeout.is_zero() {
            return Err(LimiterError::invalid("storage timeout must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(LimiterError::invalid("max retries must be at least 1"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(LimiterError::invalid("retry backoff cap is below its base"));
        }

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        info!(
            algorithm = %self.algorithm,
            storage = storage.name(),
            fallback = ?self.fallback,
            default_quota = %self.resolver.default_quota(),
            rules = self.resolver.rule_count(),
            "Rate limiter initialized"
        );

        Ok(Limiter {
            algorithm: self.algorithm,
            resolver: RwLock::new(Arc::new(self.resolver)),
            fallback: self.fallback,
            storage,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            observer: self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
            storage_timeout: self.storage_timeout,
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        })
    }
}

/// The admission engine.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// It holds no per-key state of its own; every decision reads through to the
/// storage backend and commits with a compare-and-swap.
pub struct Limiter {
    algorithm: Algorithm,
    resolver: RwLock<Arc<QuotaResolver>>,
    fallback: FallbackPolicy,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn DecisionObserver>,
    storage_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Limiter {
    pub fn builder(algorithm: Algorithm, quota: Quota, fallback: FallbackPolicy) -> LimiterBuilder {
        LimiterBuilder::new(algorithm, quota, fallback)
    }

    /// Build a limiter from validated configuration, connecting to the shared
    /// store if one is configured.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = match config.storage_backend {
            BackendKind::Memory => Arc::new(MemoryStore::with_max_keys(config.local_cache_size)),
            BackendKind::External => Self::connect_external(config).await?,
        };

        Limiter::builder(config.algorithm, config.quota()?, config.fallback_policy)
            .resolver(config.resolver()?)
            .storage(storage)
            .clock(Arc::new(SystemClock::with_precision(config.clock_precision)))
            .storage_timeout(config.storage_timeout())
            .max_attempts(config.max_retries)
            .build()
    }

    #[cfg(feature = "redis")]
    async fn connect_external(config: &LimiterConfig) -> Result<Arc<dyn StorageBackend>> {
        use super::storage::{ExternalStore, RedisStore};

        let url = config
            .external
            .url
            .as_deref()
            .ok_or_else(|| LimiterError::invalid("the external backend needs external.url"))?;
        let store = RedisStore::connect(url, &config.external.key_prefix, config.external_ttl()?)
        .await
        .map_err(|e| LimiterError::StorageUnavailable(e.to_string()))?;

        Ok(Arc::new(ExternalStore::with_cache(
            store,
            config.local_cache_size,
            config.staleness_threshold(),
        )))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_external(_config: &LimiterConfig) -> Result<Arc<dyn StorageBackend>> {
        Err(LimiterError::invalid(
            "the external backend requires building with the `redis` feature",
        ))
    }

    /// Spend one unit for `key`.
    pub async fn check(&self, key: &Key) -> Result<Verdict> {
        self.check_with(key, 1, None).await
    }

    /// Spend `cost` units for `key`.
    pub async fn check_cost(&self, key: &Key, cost: u64) -> Result<Verdict> {
        self.check_with(key, cost, None).await
    }

    /// Spend `cost` units for `key`, optionally under a quota that overrides the rules.
    ///
    /// `Denied` is returned as a verdict, not an error. Errors are reserved for
    /// contention that outlasted every attempt; an unreachable store is
    /// answered by the fallback policy.
    pub async fn check_with(
        &self,
        key: &Key,
        cost: u64,
        quota_override: Option<Quota>,
    ) -> Result<Verdict> {
        let started = Instant::now();
        let quota = quota_override.unwrap_or_else(|| self.quota_for(key));

        trace!(key = %key, cost = cost, quota = %quota, "Checking rate limit");

        let (verdict, attempts, degraded) = match self.decide(key, cost, &quota).await {
            Ok((verdict, attempts)) => (verdict, attempts, false),
            Err(Failure::Storage { error, attempts }) => {
                let verdict = self.fallback_verdict(&quota);
                self.log_storage_failure(key, &error, verdict);
                (verdict, attempts, true)
            }
            Err(Failure::Contention { attempts }) => {
                warn!(key = %key, attempts = attempts, "Gave up after repeated write conflicts");
                return Err(LimiterError::StorageContention {
                    key: key.to_string(),
                    attempts,
                });
            }
        };

        if verdict.is_denied() {
            debug!(key = %key, cost = cost, retry_after = ?verdict.retry_after(), "Rate limit exceeded");
        }

        self.observer.on_decision(&DecisionEvent {
            key: key.clone(),
            cost,
            verdict,
            remaining: verdict.remaining(),
            latency: started.elapsed(),
            attempts,
            degraded,
        });

        Ok(verdict)
    }

    /// Report the verdict a single-unit check would get, without spending anything.
    ///
    /// Never writes to storage; repeated peeks with no checks in between see
    /// the same stored state.
    pub async fn peek(&self, key: &Key) -> Result<Verdict> {
        self.peek_with(key, None).await
    }

    /// [`Self::peek`] under a quota that overrides the rules.
    pub async fn peek_with(&self, key: &Key, quota_override: Option<Quota>) -> Result<Verdict> {
        let quota = quota_override.unwrap_or_else(|| self.quota_for(key));

        match self.bounded(self.storage.get(key)).await {
            Ok(snapshot) => {
                let now = self.clock.now();
                Ok(self
                    .algorithm
                    .inspect(snapshot.as_ref().map(|s| &s.state), &quota, now))
            }
            Err(error) => {
                let verdict = self.fallback_verdict(&quota);
                self.log_storage_failure(key, &error, verdict);
                Ok(verdict)
            }
        }
    }

    /// Clear all state for `key`, restoring its full budget.
    pub async fn reset(&self, key: &Key) -> Result<()> {
        self.bounded(self.storage.delete(key))
            .await
            .map_err(|e| LimiterError::StorageUnavailable(e.to_string()))?;
        info!(key = %key, "Rate limit state reset");
        Ok(())
    }

    /// The quota rules would give `key`.
    pub fn quota_for(&self, key: &Key) -> Quota {
        self.resolver.read().resolve(key)
    }

    /// Swap in a new rule set. Checks already in flight finish with the old one.
    pub fn set_rules(&self, resolver: QuotaResolver) {
        info!(rules = resolver.rule_count(), "Replacing quota rules");
        *self.resolver.write() = Arc::new(resolver);
    }

    pub fn rules(&self) -> Arc<QuotaResolver> {
        self.resolver.read().clone()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// The read-decide-swap loop.
    async fn decide(
        &self,
        key: &Key,
        cost: u64,
        quota: &Quota,
    ) -> std::result::Result<(Verdict, u32), Failure> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self
                .bounded(self.storage.get(key))
                .await
                .map_err(|error| Failure::Storage {
                    error,
                    attempts: attempt,
                })?;

            let now = self.clock.now();
            let expected = snapshot.as_ref().map(|s| s.version);
            let decision = self
                .algorithm
                .decide(snapshot.as_ref().map(|s| &s.state), quota, now, cost);

            let Some(state) = decision.state else {
                return Ok((decision.verdict, attempt));
            };

            let outcome = self
                .bounded(self.storage.compare_and_swap(key, expected, &state))
                .await
                .map_err(|error| Failure::Storage {
                    error,
                    attempts: attempt,
                })?;

            match outcome {
                CasOutcome::Success(version) => {
                    trace!(key = %key, version = version, attempt = attempt, "State committed");
                    return Ok((decision.verdict, attempt));
                }
                CasOutcome::Conflict => {
                    debug!(key = %key, attempt = attempt, "Write conflict, retrying on fresh state");
                    if attempt < self.max_attempts {
                        let delay = self.backoff(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(Failure::Contention {
            attempts: self.max_attempts,
        })
    }

    /// Run a storage call under the configured deadline.
    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StorageError>
    where
        F: Future<Output = std::result::Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.storage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.storage_timeout)),
        }
    }

    /// Jittered exponential delay before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max);
        if delay.is_zero() {
            return delay;
        }
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
    }

    fn fallback_verdict(&self, quota: &Quota) -> Verdict {
        match self.fallback {
            FallbackPolicy::FailOpen => Verdict::Allowed {
                remaining: 0,
                reset_at: self.clock.now(),
            },
            FallbackPolicy::FailClosed => Verdict::Denied {
                retry_after: quota.time_per_unit(),
            },
        }
    }

    fn log_storage_failure(&self, key: &Key, error: &StorageError, verdict: Verdict) {
        match error {
            StorageError::Codec(_) => error!(
                key = %key,
                error = %error,
                fallback = ?self.fallback,
                allowed = verdict.is_allowed(),
                "Stored state is unreadable; applying fallback policy"
            ),
            _ => warn!(
                key = %key,
                storage = self.storage.name(),
                error = %error,
                fallback = ?self.fallback,
                allowed = verdict.is_allowed(),
                "Storage unavailable; applying fallback policy"
            ),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("algorithm", &self.algorithm)
            .field("fallback", &self.fallback)
            .field("storage", &self.storage)
            .field("storage_timeout", &self.storage_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[async_trait]
impl AdmissionControl for Limiter {
    async fn check(&self, key: &Key, cost: u64) -> Result<Verdict> {
        self.check_cost(key, cost).await
    }

    async fn peek(&self, key: &Key) -> Result<Verdict> {
        Limiter::peek(self, key).await
    }

    async fn reset(&self, key: &Key) -> Result<()> {
        Limiter::reset(self, key).await
    }
}
