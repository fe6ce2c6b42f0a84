//! Sharded fixed-point token-bucket limiter.
//!
//! Tokens are stored as integers scaled by [`TOKEN_SCALE`] so refill math
//! never touches floats. Each shard is an independently locked map; the
//! lock covers a single refill-then-consume step and is never held across
//! an await. Stale entries are swept opportunistically on the shard being
//! checked, so idle shards cost nothing and no background task is needed.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Mutex,
    time::{Duration, Instant},
};

use super::{LimitDecision, LimitReason, RateLimitSubject};

/// Fixed-point scale factor: one token is `2^16` scaled units.
pub const TOKEN_SCALE: u64 = 1 << 16;

/// Token-bucket limiter configuration.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Bucket size: the burst a quiet subject may spend at once.
    pub capacity_tokens: u32,
    /// Steady-state refill rate.
    pub refill_tokens_per_second: u32,
    /// Number of shards; rounded up to a power of two.
    pub shard_count: usize,
    /// Hard-lockout duration after exceeding the soft-violation budget.
    pub hard_lockout_seconds: u64,
    /// Soft violations tolerated within one window before lockout.
    pub max_soft_violations: u32,
    /// Length of the soft-violation sliding window.
    pub soft_violation_window_seconds: u64,
    /// Entries idle this long are dropped by the sweep.
    pub stale_entry_seconds: u64,
    /// Minimum spacing between sweeps of one shard.
    pub cleanup_interval_seconds: u64,
    /// Upper bound on tracked subjects across all shards; enforced per
    /// shard by least-recently-used eviction.
    pub max_tracked_endpoints: usize,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity_tokens: 8,
            refill_tokens_per_second: 8,
            shard_count: 16,
            hard_lockout_seconds: 30,
            // Generous: soft throttling handles ordinary bursts, lockout
            // is for peers that keep hammering a dry bucket
            max_soft_violations: 100,
            soft_violation_window_seconds: 10,
            stale_entry_seconds: 300,
            cleanup_interval_seconds: 60,
            max_tracked_endpoints: 65_536,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u64, // scaled by TOKEN_SCALE
    last_refill: Instant,
    soft_violations: u32,
    window_start: Instant,
    hard_until: Option<Instant>,
    last_used: Instant,
}

impl Bucket {
    fn fresh(capacity_scaled: u64, now: Instant) -> Self {
        Self {
            tokens: capacity_scaled,
            last_refill: now,
            soft_violations: 0,
            window_start: now,
            hard_until: None,
            last_used: now,
        }
    }
}

#[derive(Debug)]
struct Shard {
    buckets: HashMap<RateLimitSubject, Bucket>,
    next_sweep: Instant,
}

/// Sharded per-subject token-bucket limiter.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    shards: Box<[Mutex<Shard>]>,
    shard_mask: usize,
    capacity_scaled: u64,
    max_per_shard: usize,
}

impl TokenBucketLimiter {
    /// Create a limiter. Zero rates and capacities are clamped up to one
    /// so a misconfigured policy throttles instead of deadlocking.
    #[must_use]
    pub fn new(mut config: TokenBucketConfig) -> Self {
        config.capacity_tokens = config.capacity_tokens.max(1);
        config.refill_tokens_per_second = config.refill_tokens_per_second.max(1);

        let shard_count = config.shard_count.max(1).next_power_of_two();
        config.shard_count = shard_count;

        let now = Instant::now();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard { buckets: HashMap::new(), next_sweep: now }))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            capacity_scaled: u64::from(config.capacity_tokens) * TOKEN_SCALE,
            max_per_shard: (config.max_tracked_endpoints / shard_count).max(1),
            shard_mask: shard_count - 1,
            config,
            shards,
        }
    }

    /// Limiter for a `(rps, burst)` pair with otherwise default tuning.
    #[must_use]
    pub fn for_rate(refill_tokens_per_second: u32, capacity_tokens: u32) -> Self {
        Self::new(TokenBucketConfig {
            capacity_tokens,
            refill_tokens_per_second,
            ..TokenBucketConfig::default()
        })
    }

    /// Check and consume one token for `subject`.
    pub fn check(&self, subject: &RateLimitSubject) -> LimitDecision {
        self.check_at(subject, Instant::now())
    }

    /// Check at an explicit instant. `now` must be monotonic across calls
    /// for a given subject; tests drive this directly.
    pub fn check_at(&self, subject: &RateLimitSubject, now: Instant) -> LimitDecision {
        let mut shard = self.shard(subject).lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if now >= shard.next_sweep {
            self.sweep(&mut shard, now);
        }

        let capacity_scaled = self.capacity_scaled;
        let bucket = shard
            .buckets
            .entry(*subject)
            .or_insert_with(|| Bucket::fresh(capacity_scaled, now));
        bucket.last_used = now;

        // Hard lockout takes priority over refill
        if let Some(until) = bucket.hard_until {
            if now < until {
                let remaining = until.duration_since(now);
                return LimitDecision::denied(
                    LimitReason::HardLockout,
                    remaining.as_millis() as u64,
                );
            }
            bucket.hard_until = None;
            bucket.soft_violations = 0;
            bucket.window_start = now;
        }

        // Refill, then consume
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = refill(bucket.tokens, elapsed, self.config.refill_tokens_per_second)
            .min(capacity_scaled);
        bucket.last_refill = now;

        if bucket.tokens >= TOKEN_SCALE {
            bucket.tokens -= TOKEN_SCALE;
            return LimitDecision::allowed((bucket.tokens / TOKEN_SCALE).min(u64::from(u16::MAX)) as u16);
        }

        // Soft violation inside the sliding window
        let window = Duration::from_secs(self.config.soft_violation_window_seconds);
        if now.saturating_duration_since(bucket.window_start) > window {
            bucket.window_start = now;
            bucket.soft_violations = 0;
        }
        bucket.soft_violations += 1;

        let retry_after_ms = ms_until_next_token(bucket.tokens, self.config.refill_tokens_per_second);

        if bucket.soft_violations > self.config.max_soft_violations {
            bucket.hard_until = Some(now + Duration::from_secs(self.config.hard_lockout_seconds));
            tracing::warn!(subject = %subject, "rate limit hard lockout armed");
        }

        LimitDecision::denied(LimitReason::SoftThrottle, retry_after_ms)
    }

    /// Number of tracked subjects across all shards.
    #[must_use]
    pub fn tracked_subjects(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(std::sync::PoisonError::into_inner).buckets.len())
            .sum()
    }

    fn shard(&self, subject: &RateLimitSubject) -> &Mutex<Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        subject.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    fn sweep(&self, shard: &mut Shard, now: Instant) {
        shard.next_sweep = now + Duration::from_secs(self.config.cleanup_interval_seconds);

        let stale = Duration::from_secs(self.config.stale_entry_seconds);
        shard.buckets.retain(|_, b| now.saturating_duration_since(b.last_used) < stale);

        // LRU eviction down to the per-shard cap
        if shard.buckets.len() > self.max_per_shard {
            let mut by_age: Vec<(RateLimitSubject, Instant)> =
                shard.buckets.iter().map(|(s, b)| (*s, b.last_used)).collect();
            by_age.sort_by_key(|(_, used)| *used);

            let excess = shard.buckets.len() - self.max_per_shard;
            for (subject, _) in by_age.into_iter().take(excess) {
                shard.buckets.remove(&subject);
            }
        }
    }
}

/// Add `elapsed * rate` scaled tokens, saturating.
fn refill(tokens: u64, elapsed: Duration, rate_per_second: u32) -> u64 {
    let added = elapsed.as_micros()
        .saturating_mul(u128::from(rate_per_second))
        .saturating_mul(u128::from(TOKEN_SCALE))
        / 1_000_000;
    tokens.saturating_add(added.min(u128::from(u64::MAX)) as u64)
}

/// Milliseconds until the bucket reaches one whole token, rounded up.
fn ms_until_next_token(tokens: u64, rate_per_second: u32) -> u64 {
    let deficit = TOKEN_SCALE.saturating_sub(tokens);
    let per_second = u128::from(rate_per_second) * u128::from(TOKEN_SCALE);
    let ms = (u128::from(deficit) * 1000).div_ceil(per_second);
    ms.min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> RateLimitSubject {
        RateLimitSubject::new(0x10, "10.1.2.3:40000".parse().unwrap())
    }

    fn subject_n(n: u16) -> RateLimitSubject {
        RateLimitSubject::new(n, format!("10.1.2.3:{}", 40_000 + n).parse().unwrap())
    }

    #[test]
    fn burst_then_throttle() {
        let limiter = TokenBucketLimiter::for_rate(8, 8);
        let now = Instant::now();
        let subject = subject();

        for i in 0..8 {
            let decision = limiter.check_at(&subject, now);
            assert!(decision.allowed, "token {i} should be granted");
            assert_eq!(decision.credit, 7 - i);
        }

        let denied = limiter.check_at(&subject, now);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, LimitReason::SoftThrottle);
        // 8 tokens/sec refills one token every 125 ms
        assert_eq!(denied.retry_after_ms, 125);
    }

    #[test]
    fn refill_is_monotonic_and_capped() {
        let limiter = TokenBucketLimiter::for_rate(4, 8);
        let start = Instant::now();
        let subject = subject();

        // Drain the bucket
        for _ in 0..8 {
            assert!(limiter.check_at(&subject, start).allowed);
        }
        assert!(!limiter.check_at(&subject, start).allowed);

        // 250 ms at 4/s refills exactly one token
        let later = start + Duration::from_millis(250);
        assert!(limiter.check_at(&subject, later).allowed);
        assert!(!limiter.check_at(&subject, later).allowed);

        // A long idle period refills to capacity, never beyond
        let much_later = later + Duration::from_secs(3600);
        for _ in 0..8 {
            assert!(limiter.check_at(&subject, much_later).allowed);
        }
        assert!(!limiter.check_at(&subject, much_later).allowed);
    }

    #[test]
    fn soft_violations_escalate_to_hard_lockout() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            capacity_tokens: 1,
            refill_tokens_per_second: 1,
            max_soft_violations: 3,
            soft_violation_window_seconds: 10,
            hard_lockout_seconds: 30,
            ..TokenBucketConfig::default()
        });
        let now = Instant::now();
        let subject = subject();

        assert!(limiter.check_at(&subject, now).allowed);

        // Three tolerated soft violations, the fourth arms the lockout
        for _ in 0..4 {
            let denied = limiter.check_at(&subject, now);
            assert_eq!(denied.reason, LimitReason::SoftThrottle);
        }

        // Locked out for the full duration, regardless of refill
        for secs in [1u64, 15, 29] {
            let denied = limiter.check_at(&subject, now + Duration::from_secs(secs));
            assert_eq!(denied.reason, LimitReason::HardLockout);
            assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 30_000);
        }

        // After expiry the bucket is refilled and usable again
        let after = now + Duration::from_secs(31);
        let decision = limiter.check_at(&subject, after);
        assert!(decision.allowed);
    }

    #[test]
    fn subjects_do_not_share_buckets() {
        let limiter = TokenBucketLimiter::for_rate(1, 1);
        let now = Instant::now();

        assert!(limiter.check_at(&subject_n(1), now).allowed);
        assert!(!limiter.check_at(&subject_n(1), now).allowed);

        // A different opcode from the same peer has its own bucket
        assert!(limiter.check_at(&subject_n(2), now).allowed);
    }

    #[test]
    fn stale_entries_are_swept() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            shard_count: 1,
            stale_entry_seconds: 60,
            cleanup_interval_seconds: 10,
            ..TokenBucketConfig::default()
        });
        let now = Instant::now();

        for n in 0..32 {
            limiter.check_at(&subject_n(n), now);
        }
        assert_eq!(limiter.tracked_subjects(), 32);

        // Re-touching within the stale window keeps everything tracked
        let later = now + Duration::from_secs(30);
        for n in 0..32 {
            limiter.check_at(&subject_n(n), later);
        }
        assert_eq!(limiter.tracked_subjects(), 32);

        // One check far past the stale threshold sweeps the rest
        let much_later = later + Duration::from_secs(120);
        limiter.check_at(&subject_n(0), much_later);
        assert_eq!(limiter.tracked_subjects(), 1);
    }

    #[test]
    fn tracked_subjects_are_bounded_per_shard() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            shard_count: 1,
            max_tracked_endpoints: 8,
            cleanup_interval_seconds: 0, // sweep on every check
            stale_entry_seconds: 3600,
            ..TokenBucketConfig::default()
        });

        let mut now = Instant::now();
        for n in 0..64 {
            now += Duration::from_millis(1);
            limiter.check_at(&subject_n(n), now);
        }

        // One over the cap can exist transiently (the sweep runs before
        // insertion); the bound holds from the next check onward.
        assert!(limiter.tracked_subjects() <= 9);
    }

    #[test]
    fn retry_after_reflects_partial_refill() {
        let limiter = TokenBucketLimiter::for_rate(8, 1);
        let start = Instant::now();
        let subject = subject();

        assert!(limiter.check_at(&subject, start).allowed);

        // 62.5 ms into a 125 ms refill interval: ~63 ms remain
        let denied = limiter.check_at(&subject, start + Duration::from_micros(62_500));
        assert!(!denied.allowed);
        assert!((62..=64).contains(&denied.retry_after_ms), "got {}", denied.retry_after_ms);
    }
}
