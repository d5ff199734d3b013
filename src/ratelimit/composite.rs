//! Several named limits enforced together.
//!
//! A request can be subject to more than one limit at once, for example
//! 10 per second and 1000 per day. [`CompositeLimiter`] checks the members
//! from the tightest capacity to the loosest and stops at the first denial.
//! Members that already admitted the request keep the spend; nothing is
//! rolled back.
//!
//! Requests come either as an opaque [`Key`] or as labelled dimensions
//! (`app`, `endpoint`, `user`, ...). A member with a [`Scope`] only applies to
//! dimensioned requests matching its filters, and counts them under a key in
//! which every dimension it does not distinguish is replaced by [`ANY`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::AdmissionControl;
use super::clock::Timestamp;
use super::key::{Key, ANY};
use super::limiter::Limiter;
use super::quota::Quota;
use super::state::Verdict;
use crate::error::{LimiterError, Result};

/// Which requests a member applies to, and how it partitions them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    only: Vec<(String, String)>,
    per: Vec<String>,
}

impl Scope {
    /// A scope that matches every dimensioned request and counts them all together.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply only to requests whose `dimension` equals `value`.
    pub fn only(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        self.only.push((dimension.into(), value.into()));
        self
    }

    /// Keep a separate counter for each value of `dimension`.
    pub fn per(mut self, dimension: impl Into<String>) -> Self {
        self.per.push(dimension.into());
        self
    }

    pub fn matches(&self, request: &[(&str, &str)]) -> bool {
        self.only.iter().all(|(dimension, wanted)| {
            request
                .iter()
                .any(|(d, v)| *d == dimension.as_str() && *v == wanted.as_str())
        })
    }

    /// The key this scope counts `request` under.
    pub fn key_for(&self, request: &[(&str, &str)]) -> Key {
        Key::composite(request.iter().map(|&(dimension, value)| {
            if self.distinguishes(dimension) {
                (dimension, value)
            } else {
                (dimension, ANY)
            }
        }))
    }

    fn distinguishes(&self, dimension: &str) -> bool {
        self.per.iter().any(|p| p == dimension) || self.only.iter().any(|(d, _)| d == dimension)
    }
}

/// What a call is about.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Key(&'a Key),
    Request(&'a [(&'a str, &'a str)]),
}

/// A named member of a [`CompositeLimiter`].
#[derive(Debug, Clone)]
struct Member {
    name: String,
    limiter: Arc<Limiter>,
    scope: Option<Scope>,
}

impl Member {
    /// The key this member counts `target` under, before namespacing.
    /// `None` when the member does not apply.
    fn subject(&self, target: Target<'_>) -> Option<Key> {
        match (&self.scope, target) {
            (None, Target::Key(key)) => Some(key.clone()),
            (None, Target::Request(request)) => Some(Key::composite(request.iter().copied())),
            (Some(_), Target::Key(_)) => None,
            (Some(scope), Target::Request(request)) => {
                scope.matches(request).then(|| scope.key_for(request))
            }
        }
    }
}

/// One member's share of a call.
struct Planned<'a> {
    member: &'a Member,
    key: Key,
    quota: Quota,
}

/// Checks a key against every member limiter.
#[derive(Debug, Clone, Default)]
pub struct CompositeLimiter {
    members: Vec<Member>,
}

impl CompositeLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named limit applying to every request. Names must be unique;
    /// they namespace the member's keys.
    pub fn with_limit(self, name: impl Into<String>, limiter: Arc<Limiter>) -> Result<Self> {
        self.push(name.into(), limiter, None)
    }

    /// Add a named limit applying only to dimensioned requests within `scope`.
    pub fn with_scoped_limit(
        self,
        name: impl Into<String>,
        limiter: Arc<Limiter>,
        scope: Scope,
    ) -> Result<Self> {
        self.push(name.into(), limiter, Some(scope))
    }

    fn push(mut self, name: String, limiter: Arc<Limiter>, scope: Option<Scope>) -> Result<Self> {
        if name.is_empty() {
            return Err(LimiterError::invalid("composite limit name is empty"));
        }
        if self.members.iter().any(|m| m.name == name) {
            return Err(LimiterError::invalid(format!(
                "duplicate composite limit name: {}",
                name
            )));
        }
        self.members.push(Member {
            name,
            limiter,
            scope,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Applicable members with their namespaced key and quota, tightest first.
    ///
    /// Quotas are resolved on the un-namespaced key so member rules match
    /// the caller's key.
    fn plan(&self, target: Target<'_>) -> Vec<Planned<'_>> {
        let mut planned: Vec<Planned<'_>> = self
            .members
            .iter()
            .filter_map(|member| {
                let Some(subject) = member.subject(target) else {
                    trace!(limit = %member.name, "Limit does not apply");
                    return None;
                };
                Some(Planned {
                    member,
                    key: subject.namespaced(&member.name),
                    quota: member.limiter.quota_for(&subject),
                })
            })
            .collect();
        planned.sort_by_key(|p| p.quota.limit());
        planned
    }

    /// Spend `cost` units for an opaque key against every unscoped member.
    pub async fn check(&self, key: &Key, cost: u64) -> Result<Verdict> {
        self.check_target(Target::Key(key), cost).await
    }

    /// Spend `cost` units for a dimensioned request against every member it matches.
    pub async fn check_request(&self, request: &[(&str, &str)], cost: u64) -> Result<Verdict> {
        self.check_target(Target::Request(request), cost).await
    }

    async fn check_target(&self, target: Target<'_>, cost: u64) -> Result<Verdict> {
        let mut combined = None;

        for planned in self.plan(target) {
            let verdict = planned
                .member
                .limiter
                .check_with(&planned.key, cost, Some(planned.quota))
                .await?;
            if verdict.is_denied() {
                debug!(key = %planned.key, limit = %planned.member.name, "Composite limit exceeded");
                return Ok(verdict);
            }
            combined = Some(merge(combined, verdict));
        }

        Ok(combined.unwrap_or(UNLIMITED))
    }

    /// What each member would answer, folded the same way as [`Self::check`].
    pub async fn peek(&self, key: &Key) -> Result<Verdict> {
        self.peek_target(Target::Key(key)).await
    }

    pub async fn peek_request(&self, request: &[(&str, &str)]) -> Result<Verdict> {
        self.peek_target(Target::Request(request)).await
    }

    async fn peek_target(&self, target: Target<'_>) -> Result<Verdict> {
        let mut combined = None;

        for planned in self.plan(target) {
            let verdict = planned
                .member
                .limiter
                .peek_with(&planned.key, Some(planned.quota))
                .await?;
            if verdict.is_denied() {
                return Ok(verdict);
            }
            combined = Some(merge(combined, verdict));
        }

        Ok(combined.unwrap_or(UNLIMITED))
    }

    /// Reset `key` in every unscoped member.
    pub async fn reset(&self, key: &Key) -> Result<()> {
        self.reset_target(Target::Key(key)).await
    }

    /// Reset the counters `request` maps to in every member it matches.
    pub async fn reset_request(&self, request: &[(&str, &str)]) -> Result<()> {
        self.reset_target(Target::Request(request)).await
    }

    async fn reset_target(&self, target: Target<'_>) -> Result<()> {
        for planned in self.plan(target) {
            planned.member.limiter.reset(&planned.key).await?;
        }
        Ok(())
    }
}

/// Verdict when no member applies.
const UNLIMITED: Verdict = Verdict::Allowed {
    remaining: u64::MAX,
    reset_at: Timestamp::ZERO,
};

/// Smallest remaining, latest reset.
fn merge(acc: Option<Verdict>, next: Verdict) -> Verdict {
    match (acc, next) {
        (
            Some(Verdict::Allowed {
                remaining: a,
                reset_at: ra,
            }),
            Verdict::Allowed {
                remaining: b,
                reset_at: rb,
            },
        ) => Verdict::Allowed {
            remaining: a.min(b),
            reset_at: ra.max(rb),
        },
        (_, next) => next,
    }
}

#[async_trait]
impl AdmissionControl for CompositeLimiter {
    async fn check(&self, key: &Key, cost: u64) -> Result<Verdict> {
        CompositeLimiter::check(self, key, cost).await
    }

    async fn peek(&self, key: &Key) -> Result<Verdict> {
        CompositeLimiter::peek(self, key).await
    }

    async fn reset(&self, key: &Key) -> Result<()> {
        CompositeLimiter::reset(self, key).await
    }
}
