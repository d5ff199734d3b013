//! Quotaguard - Rate Limiting Engine
//!
//! This crate decides, for a stream of requests identified by keys, whether
//! each one is admitted under a configured quota. It offers token bucket,
//! sliding window and leaky bucket strategies over pluggable storage: an
//! in-process sharded map, or a shared store reached through a versioned
//! compare-and-swap protocol so that many processes enforce one global limit.

pub mod config;
pub mod error;
pub mod ratelimit;
