//! Configuration management for quotaguard.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    Algorithm, BackendKind, FallbackPolicy, Precision, Quota, QuotaResolver, RulesConfig,
};

/// Prefix for environment overrides, e.g. `QUOTAGUARD__CAPACITY=20`.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for a limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Admission strategy
    pub algorithm: Algorithm,

    /// Sustained budget per key. Signed so that a negative value is reported
    /// as invalid rather than as a parse error.
    pub capacity: i64,

    /// Units regained per second
    pub refill_rate_per_second: f64,

    /// Sliding window length in seconds; defaults to the full refill time
    #[serde(default)]
    pub window_secs: Option<f64>,

    /// Extra units admissible on top of `capacity`
    #[serde(default)]
    pub burst: u64,

    /// What to answer while storage is unreachable. Required.
    pub fallback_policy: FallbackPolicy,

    #[serde(default)]
    pub storage_backend: BackendKind,

    /// Deadline for a single storage call
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// Read-decide-swap attempts per check
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Bound on memory-resident state (memory store keys or cached snapshots)
    #[serde(default = "default_cache_size")]
    pub local_cache_size: usize,

    /// How long a cached shared-store snapshot may be reused, in milliseconds
    #[serde(default)]
    pub staleness_threshold_ms: u64,

    #[serde(default)]
    pub clock_precision: Precision,

    #[serde(default)]
    pub external: ExternalConfig,

    /// Inline quota rules
    #[serde(default)]
    pub rules: Option<RulesConfig>,

    /// Path to a separate rules file; ignored when `rules` is set
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Shared-store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every stored key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Idle keys expire after this many seconds; `0` disables expiry. When
    /// unset, the longest idle retention of any configured quota is used.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: None,
        }
    }
}

fn default_storage_timeout_ms() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_cache_size() -> usize {
    10000
}

fn default_key_prefix() -> String {
    "quotaguard:".to_string()
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load a YAML file and layer `{env_prefix}__*` environment variables on top.
    ///
    /// Nested fields use a double underscore as well, e.g.
    /// `QUOTAGUARD__EXTERNAL__URL`.
    pub fn load<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Yaml)
                    .required(true),
            )
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Reject values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity <= 0 {
            return Err(LimiterError::invalid(format!(
                "capacity must be positive, got {}",
                self.capacity
            )));
        }
        if self.storage_timeout_ms == 0 {
            return Err(LimiterError::invalid("storage_timeout_ms must be positive"));
        }
        if self.max_retries == 0 {
            return Err(LimiterError::invalid("max_retries must be at least 1"));
        }
        if self.storage_backend == BackendKind::External && self.external.url.is_none() {
            return Err(LimiterError::invalid(
                "the external backend needs external.url",
            ));
        }
        let quota = self.quota()?;
        if let Some(rules) = &self.rules {
            QuotaResolver::from_config(rules, quota)?;
        }
        if self.storage_backend == BackendKind::External {
            self.external_ttl()?;
        }
        Ok(())
    }

    /// Expiry for keys in the shared store. An expiry shorter than a quota's
    /// idle retention would let a drained key come back with a full budget.
    pub fn external_ttl(&self) -> Result<Duration> {
        let needed = self.resolver()?.longest_idle_retention();
        match self.external.ttl_secs {
            None => Ok(Duration::from_secs(needed.as_secs().saturating_add(1))),
            Some(0) => Ok(Duration::ZERO),
            Some(secs) if Duration::from_secs(secs) < needed => Err(LimiterError::invalid(format!(
                "external.ttl_secs {} is shorter than the longest quota retention {:?}",
                secs, needed
            ))),
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// The default quota described by this configuration.
    pub fn quota(&self) -> Result<Quota> {
        let capacity = u64::try_from(self.capacity).map_err(|_| {
            LimiterError::invalid(format!("capacity must be positive, got {}", self.capacity))
        })?;
        let quota = Quota::new(capacity, self.refill_rate_per_second)?.with_burst(self.burst);

        match self.window_secs {
            Some(secs) if !secs.is_finite() || secs <= 0.0 => Err(LimiterError::invalid(
                format!("window_secs must be positive, got {}", secs),
            )),
            Some(secs) => {
                let window = Duration::try_from_secs_f64(secs).map_err(|_| {
                    LimiterError::invalid(format!("window_secs {} is too large", secs))
                })?;
                quota.with_window(window)
            }
            None => Ok(quota),
        }
    }

    /// Quota rules: inline rules first, then `rules_path`, else just the default quota.
    pub fn resolver(&self) -> Result<QuotaResolver> {
        let quota = self.quota()?;
        match (&self.rules, &self.rules_path) {
            (Some(rules), _) => QuotaResolver::from_config(rules, quota),
            (None, Some(path)) => QuotaResolver::from_config(&RulesConfig::from_file(path)?, quota),
            (None, None) => Ok(QuotaResolver::new(quota)),
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}
