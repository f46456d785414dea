//! Sluice - Rate Limiting Decision Engine
//!
//! This crate decides whether a request identified by a caller key may
//! proceed under a named rule. Rules pick one of three algorithms (fixed
//! window, sliding window counter, token bucket); counters live in a store
//! whose primitives are atomic per key, either in process or in Redis, so
//! any number of callers can share one limit without over-admitting.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
