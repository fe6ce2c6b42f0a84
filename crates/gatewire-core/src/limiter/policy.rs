//! Policy-tiered rate limiter.
//!
//! Handlers declare `(requests_per_second, burst)` policies in their
//! attributes. Quantizing those onto fixed tiers bounds the number of
//! distinct limiters the process can ever hold; a shared cache then maps
//! each tier to one [`TokenBucketLimiter`] serving every handler on that
//! tier. Cross-talk is impossible because every check keys its bucket by
//! the full `(op_code, endpoint)` subject.
//!
//! Entries are reference-counted around each check so the sweep can never
//! dispose a limiter mid-decision: disposal flags the entry, waits for
//! active users to drain, then drops it.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use super::{
    LimitDecision, LimitReason, RateLimitSubject, TokenBucketConfig, TokenBucketLimiter,
};

/// Hard cap on cached policy tiers.
pub const MAX_POLICIES: usize = 64;

/// Checks between opportunistic sweeps of the policy cache.
const SWEEP_EVERY_N: u64 = 1024;

/// Idle time after which a cached policy limiter is disposed.
const POLICY_TTL: Duration = Duration::from_secs(600);

/// Longest a disposal will wait for in-flight checks to drain.
const DISPOSE_WAIT: Duration = Duration::from_millis(100);

/// A `(requests_per_second, burst)` rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RatePolicy {
    /// Steady-state request rate.
    pub requests_per_second: u32,
    /// Burst capacity.
    pub burst: u32,
}

const RPS_TIERS: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
const BURST_TIERS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

impl RatePolicy {
    /// A policy with the given rate and burst.
    #[must_use]
    pub const fn new(requests_per_second: u32, burst: u32) -> Self {
        Self { requests_per_second, burst }
    }

    /// Snap onto the fixed tier grid.
    ///
    /// Values round up to the next tier; values above the top tier clamp
    /// down to it. Zero maps to the lowest tier.
    #[must_use]
    pub fn quantize(self) -> Self {
        Self {
            requests_per_second: quantize_to(&RPS_TIERS, self.requests_per_second),
            burst: quantize_to(&BURST_TIERS, self.burst),
        }
    }

    /// Manhattan distance in `(rps, burst)` space, for nearest-policy
    /// reuse at cache capacity.
    fn distance(self, other: Self) -> u64 {
        u64::from(self.requests_per_second.abs_diff(other.requests_per_second))
            + u64::from(self.burst.abs_diff(other.burst))
    }
}

fn quantize_to(tiers: &[u32], value: u32) -> u32 {
    for &tier in tiers {
        if value <= tier {
            return tier;
        }
    }
    tiers[tiers.len() - 1]
}

struct PolicyEntry {
    limiter: TokenBucketLimiter,
    /// Milliseconds since limiter start, for TTL accounting.
    last_used: AtomicU64,
    /// In-flight checks holding this entry.
    refs: AtomicU32,
    /// Set once the sweep has claimed this entry; no further checks may
    /// use it.
    disposed: AtomicBool,
}

/// Rate limiter with a bounded cache of quantized policy tiers.
pub struct PolicyRateLimiter {
    entries: DashMap<RatePolicy, Arc<PolicyEntry>>,
    checks: AtomicU64,
    shutting_down: AtomicBool,
    started: Instant,
    template: TokenBucketConfig,
}

impl PolicyRateLimiter {
    /// Create a policy limiter. `template` supplies the non-rate tuning
    /// (shards, lockout, eviction) applied to every tier's limiter.
    #[must_use]
    pub fn new(template: TokenBucketConfig) -> Self {
        Self {
            entries: DashMap::new(),
            checks: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            started: Instant::now(),
            template,
        }
    }

    /// Check `(op_code, endpoint)` against `policy`.
    ///
    /// The decision is always produced by a live entry: acquisition
    /// re-checks the disposed flag after taking a reference and retries
    /// on a fresh entry if the sweep won the race.
    pub fn check(&self, policy: RatePolicy, op_code: u16, endpoint: SocketAddr) -> LimitDecision {
        if self.shutting_down.load(Ordering::Acquire) {
            return LimitDecision::denied(LimitReason::HardLockout, 0);
        }

        let quantized = policy.quantize();
        let subject = RateLimitSubject::new(op_code, endpoint);

        let decision = loop {
            let entry = self.entry_for(quantized);

            entry.refs.fetch_add(1, Ordering::AcqRel);
            if entry.disposed.load(Ordering::Acquire) {
                // Sweep claimed it between lookup and acquire; retry
                entry.refs.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            entry.last_used.store(self.elapsed_ms(), Ordering::Relaxed);
            let decision = entry.limiter.check(&subject);
            entry.refs.fetch_sub(1, Ordering::AcqRel);
            break decision;
        };

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_N == SWEEP_EVERY_N - 1 {
            self.sweep();
        }

        decision
    }

    /// Deny all future checks and dispose every cached limiter.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let policies: Vec<RatePolicy> = self.entries.iter().map(|e| *e.key()).collect();
        for policy in policies {
            if let Some((_, entry)) = self.entries.remove(&policy) {
                dispose(&entry);
            }
        }
    }

    /// Number of cached policy tiers.
    #[must_use]
    pub fn cached_policies(&self) -> usize {
        self.entries.len()
    }

    fn entry_for(&self, quantized: RatePolicy) -> Arc<PolicyEntry> {
        if let Some(entry) = self.entries.get(&quantized) {
            return Arc::clone(&entry);
        }

        // At capacity, reuse the nearest cached policy instead of growing
        if self.entries.len() >= MAX_POLICIES {
            let nearest = self
                .entries
                .iter()
                .min_by_key(|e| quantized.distance(*e.key()))
                .map(|e| Arc::clone(e.value()));
            if let Some(entry) = nearest {
                return entry;
            }
        }

        let config = TokenBucketConfig {
            capacity_tokens: quantized.burst,
            refill_tokens_per_second: quantized.requests_per_second,
            ..self.template.clone()
        };
        let fresh = Arc::new(PolicyEntry {
            limiter: TokenBucketLimiter::new(config),
            last_used: AtomicU64::new(self.elapsed_ms()),
            refs: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        });

        Arc::clone(self.entries.entry(quantized).or_insert(fresh).value())
    }

    fn sweep(&self) {
        let now_ms = self.elapsed_ms();
        let ttl_ms = POLICY_TTL.as_millis() as u64;

        let idle: Vec<RatePolicy> = self
            .entries
            .iter()
            .filter(|e| now_ms.saturating_sub(e.last_used.load(Ordering::Relaxed)) > ttl_ms)
            .map(|e| *e.key())
            .collect();

        for policy in idle {
            if let Some((_, entry)) = self.entries.remove(&policy) {
                tracing::debug!(?policy, "disposing idle policy limiter");
                dispose(&entry);
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for PolicyRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRateLimiter")
            .field("cached_policies", &self.cached_policies())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// Flag the entry disposed, then wait (bounded spin, then sleep) for
/// in-flight checks to drain.
fn dispose(entry: &Arc<PolicyEntry>) {
    entry.disposed.store(true, Ordering::Release);

    for _ in 0..64 {
        if entry.refs.load(Ordering::Acquire) == 0 {
            return;
        }
        std::hint::spin_loop();
    }

    let deadline = Instant::now() + DISPOSE_WAIT;
    while entry.refs.load(Ordering::Acquire) != 0 {
        if Instant::now() >= deadline {
            tracing::warn!("policy entry still referenced after dispose wait");
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
