//! Quota rules configuration and key matching.
//!
//! This module maps a key to the quota that governs it. Rules are matched in
//! a fixed order of precedence:
//!
//! 1. an exact key match,
//! 2. the most specific pattern (longest literal prefix before the first
//!    `*`, then most literal characters overall, then declaration order),
//! 3. the default quota.
//!
//! Resolution never fails; a key no rule mentions gets the default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::key::Key;
use super::quota::{Quota, TimeUnit};
use crate::error::{LimiterError, Result};

/// A complete rules file: an optional default plus a list of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Quota for keys no rule matches. Falls back to the limiter's base quota.
    #[serde(default)]
    pub default: Option<RateLimitRule>,
    /// Per-key and per-pattern rules
    #[serde(default)]
    pub rules: Vec<QuotaRule>,
}

/// A rate limit rule specifying the limit and time unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Extra units allowed in a burst on top of `requests_per_unit`
    #[serde(default)]
    pub burst: u64,
    /// Optional name/description for this limit
    #[serde(default)]
    pub name: Option<String>,
}

impl RateLimitRule {
    /// Build the quota this rule describes.
    pub fn quota(&self) -> Result<Quota> {
        Ok(Quota::per_unit(self.requests_per_unit, self.unit)?.with_burst(self.burst))
    }
}

/// A rule bound to a key or key pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRule {
    /// Exact key, or a pattern where `*` matches any run of characters
    pub key: String,
    #[serde(flatten)]
    pub limit: RateLimitRule,
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse quota rules: {}", e)))
    }
}

/// A `*` pattern, pre-split into its literal pieces.
#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    pieces: Vec<String>,
}

impl Pattern {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            pieces: source.split('*').map(str::to_string).collect(),
        }
    }

    /// Length of the literal text before the first `*`.
    fn prefix_len(&self) -> usize {
        self.pieces[0].len()
    }

    fn literal_len(&self) -> usize {
        self.pieces.iter().map(String::len).sum()
    }

    fn matches(&self, text: &str) -> bool {
        let first = &self.pieces[0];
        let last = &self.pieces[self.pieces.len() - 1];

        if text.len() < first.len() + last.len()
            || !text.starts_with(first.as_str())
            || !text.ends_with(last.as_str())
        {
            return false;
        }

        let mut rest = &text[first.len()..text.len() - last.len()];
        for piece in &self.pieces[1..self.pieces.len() - 1] {
            match rest.find(piece.as_str()) {
                Some(at) => rest = &rest[at + piece.len()..],
                None => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct PatternRule {
    pattern: Pattern,
    quota: Quota,
}

/// Resolves the quota that applies to a key.
#[derive(Debug, Clone)]
pub struct QuotaResolver {
    default: Quota,
    exact: HashMap<String, Quota>,
    /// Kept sorted from most to least specific.
    patterns: Vec<PatternRule>,
}

impl QuotaResolver {
    /// A resolver that gives every key `default`.
    pub fn new(default: Quota) -> Self {
        Self {
            default,
            exact: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Build a resolver from parsed rules. `fallback` is used when the rules
    /// carry no default of their own.
    pub fn from_config(config: &RulesConfig, fallback: Quota) -> Result<Self> {
        let default = match &config.default {
            Some(rule) => rule.quota()?,
            None => fallback,
        };

        let mut resolver = Self::new(default);
        for rule in &config.rules {
            let quota = rule.limit.quota().map_err(|e| {
                LimiterError::invalid(format!("rule for `{}`: {}", rule.key, e))
            })?;
            resolver = resolver.with_rule(&rule.key, quota);
        }

        info!(
            exact = resolver.exact.len(),
            patterns = resolver.patterns.len(),
            default = %resolver.default,
            "Quota rules loaded"
        );
        Ok(resolver)
    }

    /// Parse YAML rules and build a resolver from them.
    pub fn from_yaml(yaml: &str, fallback: Quota) -> Result<Self> {
        Self::from_config(&RulesConfig::from_yaml(yaml)?, fallback)
    }

    /// Add a rule for an exact key or a `*` pattern.
    ///
    /// For a repeated exact key the first rule wins; patterns of equal
    /// specificity keep their declaration order.
    pub fn with_rule(mut self, key: &str, quota: Quota) -> Self {
        if key.contains('*') {
            let pattern = Pattern::new(key);
            let rank = (pattern.prefix_len(), pattern.literal_len());
            let at = self
                .patterns
                .iter()
                .position(|r| (r.pattern.prefix_len(), r.pattern.literal_len()) < rank)
                .unwrap_or(self.patterns.len());
            self.patterns.insert(at, PatternRule { pattern, quota });
        } else {
            self.exact.entry(key.to_string()).or_insert(quota);
        }
        self
    }

    /// Find the quota for `key`.
    pub fn resolve(&self, key: &Key) -> Quota {
        if let Some(quota) = self.exact.get(key.as_str()) {
            return *quota;
        }

        if let Some(rule) = self.patterns.iter().find(|r| r.pattern.matches(key.as_str())) {
            debug!(key = %key, pattern = %rule.pattern.source, "Matched quota pattern");
            return rule.quota;
        }

        self.default
    }

    pub fn default_quota(&self) -> Quota {
        self.default
    }

    /// Number of exact and pattern rules.
    /// The longest [`Quota::idle_retention`] any key can be resolved to.
    pub fn longest_idle_retention(&self) -> Duration {
        self.exact
            .values()
            .chain(self.patterns.iter().map(|rule| &rule.quota))
            .map(Quota::idle_retention)
            .fold(self.default.idle_retention(), Duration::max)
    }

    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }
}
