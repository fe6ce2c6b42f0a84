//! Gatewire packet-pipeline core.
//!
//! Everything between the socket and the user handler lives here, free of
//! any I/O: transports hand decoded packets to the [`Pipeline`], which
//! runs them through the ordered middleware chain (rate limit →
//! permission → unwrap → concurrency → timeout → handler) and hands back
//! either wrapped response packets or exactly one control frame. The
//! transports own the sockets; this crate owns the decisions.
//!
//! # Components
//!
//! - [`transform`]: per-packet-type encrypt/decrypt/compress/decompress
//!   capability table
//! - [`limiter`]: sharded token-bucket rate limiter plus the policy-tiered
//!   wrapper over it
//! - [`gate`]: per-opcode bounded concurrency with FIFO queueing
//! - [`pipeline`]: the middleware chain, handler registry, and per-packet
//!   context
//!
//! # Concurrency
//!
//! No lock in this crate is held across an `.await`. Suspension points are
//! limited to queued gate entry, the timeout delay, and whatever the user
//! handler does; every limiter and registry path is non-blocking.

#![forbid(unsafe_code)]

pub mod gate;
pub mod limiter;
pub mod pipeline;
pub mod transform;

pub use gate::{ConcurrencyGate, GateConfig, GateError, Lease};
pub use limiter::{
    LimitDecision, LimitReason, PolicyRateLimiter, RateLimitSubject, RatePolicy, TokenBucketConfig,
    TokenBucketLimiter,
};
pub use pipeline::{
    DispatchResult, FnHandler, HandlerAttributes, HandlerError, HandlerRegistry, InboundMiddleware,
    MiddlewareStage, OutboundMiddleware, PacketContext, PacketHandler, PeerInfo, Pipeline,
    PipelineConfig,
};
pub use transform::{TransformError, TransformRegistry, TransformSet};
