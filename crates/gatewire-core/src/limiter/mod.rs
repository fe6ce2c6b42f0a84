//! Rate limiting: sharded token buckets and the policy-tiered wrapper.
//!
//! Two layers. [`TokenBucketLimiter`] is the mechanism: per-subject
//! fixed-point token buckets partitioned into shards, with soft-throttle
//! escalation into hard lockout and opportunistic eviction.
//! [`PolicyRateLimiter`] is the policy layer: it quantizes
//! attribute-declared `(rps, burst)` pairs onto fixed tiers and maintains
//! a bounded cache of one limiter per tier, so arbitrarily many handler
//! declarations collapse into a small number of bucket tables.
//!
//! Subjects are `(op_code, endpoint)` composites; sequence ids never
//! participate, so sequenced retries of the same operation share one
//! bucket.

mod bucket;
mod policy;

use std::net::SocketAddr;

pub use bucket::{TOKEN_SCALE, TokenBucketConfig, TokenBucketLimiter};
pub use policy::{MAX_POLICIES, PolicyRateLimiter, RatePolicy};

/// Composite rate-limit key: one bucket per `(op_code, endpoint)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitSubject {
    /// Operation being limited.
    pub op_code: u16,
    /// Peer the operation came from.
    pub endpoint: SocketAddr,
}

impl RateLimitSubject {
    /// Subject for an opcode/endpoint pair.
    #[must_use]
    pub fn new(op_code: u16, endpoint: SocketAddr) -> Self {
        Self { op_code, endpoint }
    }

    /// Stable address string, for logs and diagnostics.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{:#06x}@{}", self.op_code, self.endpoint)
    }
}

impl std::fmt::Display for RateLimitSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}@{}", self.op_code, self.endpoint)
    }
}

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitReason {
    /// Not denied.
    #[default]
    None,
    /// Bucket empty; short-term backoff.
    SoftThrottle,
    /// Repeated violations; persistent denial until the lockout expires.
    HardLockout,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Suggested retry delay when denied, in milliseconds.
    pub retry_after_ms: u64,
    /// Whole tokens remaining after this check.
    pub credit: u16,
    /// Denial classification.
    pub reason: LimitReason,
}

impl LimitDecision {
    /// An allowing decision with the given remaining credit.
    #[must_use]
    pub fn allowed(credit: u16) -> Self {
        Self { allowed: true, retry_after_ms: 0, credit, reason: LimitReason::None }
    }

    /// A denying decision.
    #[must_use]
    pub fn denied(reason: LimitReason, retry_after_ms: u64) -> Self {
        Self { allowed: false, retry_after_ms, credit: 0, reason }
    }
}
