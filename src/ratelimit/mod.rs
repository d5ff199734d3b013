//! Rate limiting logic and state management.

mod algorithm;
mod backend;
mod clock;
mod composite;
mod key;
mod leaky_bucket;
mod limiter;
mod observer;
mod quota;
mod rules;
mod sliding_window;
mod state;
pub mod storage;
mod token_bucket;

pub use algorithm::Algorithm;
pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, Precision, SystemClock, Timestamp};
pub use composite::{CompositeLimiter, Scope};
pub use key::{Key, ANY};
pub use limiter::{
    FallbackPolicy, Limiter, LimiterBuilder, DEFAULT_MAX_ATTEMPTS, DEFAULT_STORAGE_TIMEOUT,
};
pub use observer::{DecisionEvent, DecisionObserver, NoopObserver, TracingObserver};
pub use quota::{Quota, TimeUnit};
pub use rules::{QuotaResolver, QuotaRule, RateLimitRule, RulesConfig};
pub use state::{Decision, LimiterState, Verdict};
pub use storage::{BackendKind, StorageBackend};
