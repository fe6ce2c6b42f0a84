//! The middleware pipeline.
//!
//! One [`Pipeline`] serves every connection of a listener. Transports
//! decode a packet, snapshot the peer, and call [`Pipeline::dispatch`];
//! the pipeline walks the inbound chain, runs the handler, walks the
//! outbound chain over each response, and returns either the wrapped
//! responses or exactly one control frame. Control flow is explicit —
//! denial paths return early with the frame instead of unwinding — and
//! every denial leaves the handler uninvoked.

mod context;
mod handler;
mod middleware;

use std::sync::Arc;

pub use context::{HandlerAttributes, PacketContext, PeerInfo};
use gatewire_proto::{
    BufferPool, ControlAction, ControlFlags, ControlFrame, ControlReason, ControlType, Packet,
    PacketFlags,
};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, PacketHandler};
pub use middleware::{InboundMiddleware, MiddlewareStage, OutboundMiddleware};
use tokio_util::sync::CancellationToken;

use crate::{
    gate::{ConcurrencyGate, GateError, Lease},
    limiter::{LimitDecision, LimitReason, PolicyRateLimiter, RateLimitSubject, TokenBucketConfig,
        TokenBucketLimiter},
    transform::TransformRegistry,
};

/// Pipeline-wide tuning.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Bucket tuning for the global endpoint limiter, used when a
    /// handler declares no rate policy.
    pub global_rate: TokenBucketConfig,
    /// Non-rate bucket tuning applied to every policy tier's limiter.
    pub policy_template: TokenBucketConfig,
}

/// Outcome of dispatching one inbound packet.
#[derive(Debug)]
pub enum DispatchResult {
    /// Handler ran; these packets are wrapped and ready for the wire.
    Handled(Vec<Packet>),
    /// A middleware denied the packet; send exactly this control frame.
    Denied(ControlFrame),
    /// Dispatch was cancelled; send nothing.
    Cancelled,
}

/// The ordered middleware pipeline and its services.
pub struct Pipeline {
    inbound: Vec<InboundMiddleware>,
    outbound: Vec<OutboundMiddleware>,
    handlers: HandlerRegistry,
    transforms: TransformRegistry,
    policy_limiter: PolicyRateLimiter,
    global_limiter: TokenBucketLimiter,
    gate: ConcurrencyGate,
    pool: Arc<BufferPool>,
}

impl Pipeline {
    /// Build a pipeline with the canonical chains and default
    /// transforms.
    #[must_use]
    pub fn new(config: PipelineConfig, pool: Arc<BufferPool>) -> Self {
        Self {
            inbound: InboundMiddleware::canonical_chain(),
            outbound: OutboundMiddleware::canonical_chain(),
            handlers: HandlerRegistry::new(),
            transforms: TransformRegistry::with_defaults(),
            policy_limiter: PolicyRateLimiter::new(config.policy_template),
            global_limiter: TokenBucketLimiter::new(config.global_rate),
            gate: ConcurrencyGate::new(),
            pool,
        }
    }

    /// Register a handler and its attributes.
    pub fn register(
        &mut self,
        attributes: HandlerAttributes,
        handler: Arc<dyn PacketHandler>,
    ) {
        self.handlers.register(attributes, handler);
    }

    /// Transformer registry, for registering custom packet types.
    pub fn transforms_mut(&mut self) -> &mut TransformRegistry {
        &mut self.transforms
    }

    /// The sorted inbound chain.
    #[must_use]
    pub fn inbound_chain(&self) -> &[InboundMiddleware] {
        &self.inbound
    }

    /// Attributes declared for an opcode, or the defaults when none are
    /// registered.
    #[must_use]
    pub fn attributes_for(&self, op_code: u16) -> HandlerAttributes {
        self.handlers
            .attributes(op_code)
            .cloned()
            .unwrap_or_else(|| HandlerAttributes::for_op(op_code))
    }

    /// Shared buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Deny all further rate-limited traffic and release limiter state.
    pub fn shutdown(&self) {
        self.policy_limiter.shutdown();
    }

    /// Run one packet through the inbound chain, the handler, and the
    /// outbound chain.
    pub async fn dispatch(
        &self,
        packet: Packet,
        peer: &PeerInfo,
        cancel: &CancellationToken,
    ) -> DispatchResult {
        let op_code = packet.op_code();
        let sequence_id = packet.sequence_id().unwrap_or(0);
        let attributes = self.attributes_for(op_code);

        let mut ctx = PacketContext {
            packet,
            peer: peer.clone(),
            attributes,
            pool: Arc::clone(&self.pool),
            cancel: cancel.clone(),
        };

        let mut lease: Option<Lease> = None;
        let mut deadline = None;

        for middleware in &self.inbound {
            if ctx.cancel.is_cancelled() {
                return DispatchResult::Cancelled;
            }

            match middleware {
                InboundMiddleware::RateLimit => {
                    if let Some(frame) = self.check_rate(&ctx, op_code, sequence_id) {
                        return DispatchResult::Denied(frame);
                    }
                },
                InboundMiddleware::Permission => {
                    let required = ctx.attributes.required_permission;
                    let actual = ctx.peer.permission_level;
                    if required > actual {
                        tracing::debug!(
                            endpoint = %ctx.peer.endpoint,
                            opcode = format_args!("{op_code:#06x}"),
                            required,
                            actual,
                            "permission denied"
                        );
                        let frame = ControlFrame::new(
                            ControlType::Fail,
                            ControlReason::Unauthenticated,
                            ControlAction::None,
                        )
                        .with_sequence_id(sequence_id)
                        .with_args(u32::from(required), u32::from(actual), u32::from(op_code));
                        return DispatchResult::Denied(frame);
                    }
                },
                InboundMiddleware::Unwrap => {
                    if let Err(frame) = self.unwrap_in_place(&mut ctx, sequence_id) {
                        return DispatchResult::Denied(frame);
                    }
                },
                InboundMiddleware::Concurrency => {
                    if let Some(config) = ctx.attributes.concurrency {
                        match self.gate.enter(op_code, config, &ctx.cancel).await {
                            Ok(granted) => lease = Some(granted),
                            Err(GateError::Rejected) => {
                                let frame = ControlFrame::new(
                                    ControlType::Fail,
                                    ControlReason::RateLimited,
                                    ControlAction::Retry,
                                )
                                .with_flags(ControlFlags::IS_TRANSIENT)
                                .with_sequence_id(sequence_id);
                                return DispatchResult::Denied(frame);
                            },
                            Err(GateError::Cancelled) => return DispatchResult::Cancelled,
                        }
                    }
                },
                InboundMiddleware::Timeout => {
                    deadline = ctx.attributes.timeout;
                },
            }
        }

        let Some(handler) = self.handlers.handler(op_code) else {
            let frame = ControlFrame::new(
                ControlType::Fail,
                ControlReason::UnsupportedPacket,
                ControlAction::None,
            )
            .with_sequence_id(sequence_id)
            .with_args(0, 0, u32::from(op_code));
            return DispatchResult::Denied(frame);
        };

        let attributes = ctx.attributes.clone();
        let child = ctx.cancel.child_token();
        ctx.cancel = child.clone();

        let mut handler_fut = handler.handle(ctx);
        let outcome = match deadline {
            Some(timeout) => tokio::select! {
                result = &mut handler_fut => Some(result),
                () = tokio::time::sleep(timeout) => {
                    // Cancel the handler and await its completion before
                    // emitting the frame, so a late response can never
                    // follow the timeout onto the wire.
                    child.cancel();
                    let _ = handler_fut.await;
                    None
                },
            },
            None => Some(handler_fut.await),
        };
        drop(lease);

        let Some(result) = outcome else {
            let timeout_ms = deadline.map_or(0, |t| t.as_millis() as u64);
            let frame = ControlFrame::new(
                ControlType::Timeout,
                ControlReason::Timeout,
                ControlAction::Retry,
            )
            .with_flags(ControlFlags::IS_TRANSIENT)
            .with_sequence_id(sequence_id)
            .with_args((timeout_ms / 100) as u32, 0, 0);
            return DispatchResult::Denied(frame);
        };

        if cancel.is_cancelled() {
            return DispatchResult::Cancelled;
        }

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(HandlerError::Cancelled) => return DispatchResult::Cancelled,
            Err(HandlerError::Internal(message)) => {
                tracing::error!(
                    opcode = format_args!("{op_code:#06x}"),
                    %message,
                    "handler failed"
                );
                let frame = ControlFrame::new(
                    ControlType::Fail,
                    ControlReason::InternalError,
                    ControlAction::None,
                )
                .with_sequence_id(sequence_id);
                return DispatchResult::Denied(frame);
            },
        };

        let mut wrapped = Vec::with_capacity(outputs.len());
        for output in outputs {
            match self.wrap_outbound(output, &attributes, peer, sequence_id) {
                Ok(packet) => wrapped.push(packet),
                Err(frame) => return DispatchResult::Denied(frame),
            }
        }
        DispatchResult::Handled(wrapped)
    }

    /// Run the outbound chain over one packet.
    ///
    /// # Errors
    ///
    /// The control frame to send instead when a wrap step cannot run.
    pub fn wrap_outbound(
        &self,
        packet: Packet,
        attributes: &HandlerAttributes,
        peer: &PeerInfo,
        sequence_id: u32,
    ) -> Result<Packet, ControlFrame> {
        let mut packet = packet;
        for middleware in &self.outbound {
            match middleware {
                OutboundMiddleware::Wrap => {
                    packet = self.wrap_in_place(packet, attributes, peer, sequence_id)?;
                },
            }
        }
        Ok(packet)
    }

    fn check_rate(
        &self,
        ctx: &PacketContext,
        op_code: u16,
        sequence_id: u32,
    ) -> Option<ControlFrame> {
        let decision: LimitDecision = match ctx.attributes.rate_policy {
            Some(policy) => self.policy_limiter.check(policy, op_code, ctx.peer.endpoint),
            // The global limiter keys by endpoint alone: every un-policied
            // opcode from one peer shares a bucket.
            None => self.global_limiter.check(&RateLimitSubject::new(0, ctx.peer.endpoint)),
        };

        if decision.allowed {
            return None;
        }

        tracing::debug!(
            endpoint = %ctx.peer.endpoint,
            opcode = format_args!("{op_code:#06x}"),
            reason = ?decision.reason,
            retry_after_ms = decision.retry_after_ms,
            "rate limited"
        );

        let retry_steps = (decision.retry_after_ms / 100) as u32;
        let frame = match decision.reason {
            LimitReason::SoftThrottle => ControlFrame::new(
                ControlType::Throttle,
                ControlReason::RateLimited,
                ControlAction::Retry,
            )
            .with_flags(ControlFlags::IS_TRANSIENT.union(ControlFlags::SLOW_DOWN))
            .with_args(0, retry_steps, u32::from(decision.credit)),
            LimitReason::HardLockout | LimitReason::None => ControlFrame::new(
                ControlType::Fail,
                ControlReason::RateLimited,
                ControlAction::Retry,
            )
            .with_flags(ControlFlags::SLOW_DOWN)
            .with_args(0, retry_steps, 0),
        };
        Some(frame.with_sequence_id(sequence_id))
    }

    fn unwrap_in_place(
        &self,
        ctx: &mut PacketContext,
        sequence_id: u32,
    ) -> Result<(), ControlFrame> {
        let deny = |reason, action| {
            ControlFrame::new(ControlType::Fail, reason, action).with_sequence_id(sequence_id)
        };

        if ctx.packet.flags().contains(PacketFlags::ENCRYPTED) {
            let Some(set) = self.transforms.get(Packet::TYPE_ID) else {
                return Err(deny(ControlReason::UnsupportedPacket, ControlAction::None));
            };
            if !set.has_decrypt() {
                return Err(deny(ControlReason::CryptoUnsupported, ControlAction::None));
            }

            let taken = take_packet(&mut ctx.packet);
            match set.decrypt(taken, &ctx.peer.encryption_key, ctx.peer.cipher_suite, &ctx.pool) {
                Ok(packet) => ctx.packet = packet,
                Err(err) => {
                    tracing::debug!(endpoint = %ctx.peer.endpoint, %err, "decrypt failed");
                    return Err(deny(ControlReason::TransformFailed, ControlAction::Retry)
                        .with_flags(ControlFlags::IS_TRANSIENT));
                },
            }
        }

        if ctx.packet.flags().contains(PacketFlags::COMPRESSED) {
            let Some(set) = self.transforms.get(Packet::TYPE_ID) else {
                return Err(deny(ControlReason::UnsupportedPacket, ControlAction::None));
            };
            if !set.has_decompress() {
                return Err(deny(ControlReason::CompressionUnsupported, ControlAction::None));
            }

            let taken = take_packet(&mut ctx.packet);
            match set.decompress(taken, &ctx.pool) {
                Ok(packet) => ctx.packet = packet,
                Err(err) => {
                    tracing::debug!(endpoint = %ctx.peer.endpoint, %err, "decompress failed");
                    return Err(deny(ControlReason::TransformFailed, ControlAction::Retry)
                        .with_flags(ControlFlags::IS_TRANSIENT));
                },
            }
        }

        Ok(())
    }

    fn wrap_in_place(
        &self,
        mut packet: Packet,
        attributes: &HandlerAttributes,
        peer: &PeerInfo,
        sequence_id: u32,
    ) -> Result<Packet, ControlFrame> {
        let deny = |reason, action| {
            ControlFrame::new(ControlType::Fail, reason, action).with_sequence_id(sequence_id)
        };

        let threshold = attributes.compression_threshold;
        let over = packet.payload().len().saturating_sub(threshold);
        let should_compress = threshold > 0
            && match packet.transport() {
                gatewire_proto::Transport::Tcp => over > threshold,
                gatewire_proto::Transport::Udp => over > 600 && over < 1200,
            };

        if should_compress {
            let Some(set) = self.transforms.get(Packet::TYPE_ID) else {
                return Err(deny(ControlReason::UnsupportedPacket, ControlAction::None));
            };
            if !set.has_compress() {
                return Err(deny(ControlReason::CompressionUnsupported, ControlAction::None));
            }
            packet = set.compress(packet, &self.pool).map_err(|err| {
                tracing::debug!(%err, "compress failed");
                deny(ControlReason::TransformFailed, ControlAction::Retry)
                    .with_flags(ControlFlags::IS_TRANSIENT)
            })?;
        }

        if attributes.encrypted {
            let Some(set) = self.transforms.get(Packet::TYPE_ID) else {
                return Err(deny(ControlReason::UnsupportedPacket, ControlAction::None));
            };
            if !set.has_encrypt() {
                return Err(deny(ControlReason::CryptoUnsupported, ControlAction::None));
            }
            packet = set
                .encrypt(packet, &peer.encryption_key, peer.cipher_suite, &self.pool)
                .map_err(|err| {
                    tracing::debug!(%err, "encrypt failed");
                    deny(ControlReason::TransformFailed, ControlAction::Retry)
                        .with_flags(ControlFlags::IS_TRANSIENT)
                })?;
        }

        Ok(packet)
    }
}

fn take_packet(slot: &mut Packet) -> Packet {
    let transport = slot.transport();
    std::mem::replace(slot, Packet::new(0, transport, gatewire_proto::PayloadBuf::empty()))
}
