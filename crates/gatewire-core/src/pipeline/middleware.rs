//! Middleware chain definitions and ordering.
//!
//! Built-in middlewares are a closed enum rather than trait objects; the
//! pipeline sorts each stage's chain by `(order, name)` and executes the
//! variants in that order. The order constants are chosen so the sorted
//! inbound chain is exactly the canonical sequence: rate limit →
//! permission → unwrap → concurrency → timeout.

/// Which chain a middleware belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareStage {
    /// Runs on received packets before the handler.
    Inbound,
    /// Runs on handler output before the wire.
    Outbound,
}

/// Built-in inbound middlewares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMiddleware {
    /// Per-policy or global rate limiting.
    RateLimit,
    /// Permission-level check.
    Permission,
    /// Decrypt and decompress flagged packets.
    Unwrap,
    /// Per-opcode concurrency gate.
    Concurrency,
    /// Handler deadline enforcement.
    Timeout,
}

impl InboundMiddleware {
    /// Chain position; lower runs first.
    #[must_use]
    pub const fn order(self) -> i32 {
        match self {
            Self::RateLimit => 10,
            Self::Permission => 20,
            Self::Unwrap => 30,
            Self::Concurrency => 40,
            Self::Timeout => 50,
        }
    }

    /// Stable name; ties in `order` break on it.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RateLimit => "rate-limit",
            Self::Permission => "permission",
            Self::Unwrap => "unwrap",
            Self::Concurrency => "concurrency",
            Self::Timeout => "timeout",
        }
    }

    /// Stage this middleware belongs to.
    #[must_use]
    pub const fn stage(self) -> MiddlewareStage {
        MiddlewareStage::Inbound
    }

    /// The canonical inbound chain, sorted.
    #[must_use]
    pub fn canonical_chain() -> Vec<Self> {
        let mut chain = vec![
            Self::Timeout,
            Self::Unwrap,
            Self::RateLimit,
            Self::Concurrency,
            Self::Permission,
        ];
        sort_chain(&mut chain, |m| (m.order(), m.name()));
        chain
    }
}

/// Built-in outbound middlewares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundMiddleware {
    /// Compress and encrypt handler output per the declared attributes.
    Wrap,
}

impl OutboundMiddleware {
    /// Chain position; lower runs first.
    #[must_use]
    pub const fn order(self) -> i32 {
        match self {
            Self::Wrap => 20,
        }
    }

    /// Stable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Wrap => "wrap",
        }
    }

    /// Stage this middleware belongs to.
    #[must_use]
    pub const fn stage(self) -> MiddlewareStage {
        MiddlewareStage::Outbound
    }

    /// The canonical outbound chain, sorted.
    #[must_use]
    pub fn canonical_chain() -> Vec<Self> {
        let mut chain = vec![Self::Wrap];
        sort_chain(&mut chain, |m| (m.order(), m.name()));
        chain
    }
}

fn sort_chain<M, K: Ord>(chain: &mut [M], key: impl Fn(&M) -> K) {
    chain.sort_by(|a, b| key(a).cmp(&key(b)));
}
