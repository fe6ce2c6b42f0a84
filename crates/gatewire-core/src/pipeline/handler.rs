//! Handler trait and the opcode-keyed handler table.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use gatewire_proto::Packet;
use thiserror::Error;

use super::context::{HandlerAttributes, PacketContext};

/// Errors a handler may surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Unexpected handler failure; becomes a `FAIL, INTERNAL_ERROR`
    /// control frame.
    #[error("handler failed: {0}")]
    Internal(String),

    /// Handler observed cancellation and stopped early. Swallowed by the
    /// pipeline; no control frame is emitted for it.
    #[error("handler cancelled")]
    Cancelled,
}

/// A user packet handler.
///
/// Runs after the full inbound chain, so the packet in the context is
/// unwrapped, admitted, and within its concurrency bound. Returned
/// packets travel the outbound chain before hitting the wire.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Process one packet, producing zero or more outbound packets.
    async fn handle(&self, ctx: PacketContext) -> Result<Vec<Packet>, HandlerError>;
}

/// Adapter registering a plain async function as a handler.
pub struct FnHandler<F>(
    /// The wrapped async function.
    pub F,
);

#[async_trait]
impl<F, Fut> PacketHandler for FnHandler<F>
where
    F: Fn(PacketContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<Packet>, HandlerError>> + Send,
{
    async fn handle(&self, ctx: PacketContext) -> Result<Vec<Packet>, HandlerError> {
        (self.0)(ctx).await
    }
}

struct Registered {
    attributes: HandlerAttributes,
    handler: Arc<dyn PacketHandler>,
}

/// Opcode-keyed table of handlers and their attributes.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<u16, Registered>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `attributes.op_code`, replacing any
    /// previous registration for that opcode.
    pub fn register(&mut self, attributes: HandlerAttributes, handler: Arc<dyn PacketHandler>) {
        self.entries.insert(attributes.op_code, Registered { attributes, handler });
    }

    /// Attributes declared for an opcode.
    #[must_use]
    pub fn attributes(&self, op_code: u16) -> Option<&HandlerAttributes> {
        self.entries.get(&op_code).map(|r| &r.attributes)
    }

    /// Handler registered for an opcode.
    #[must_use]
    pub fn handler(&self, op_code: u16) -> Option<Arc<dyn PacketHandler>> {
        self.entries.get(&op_code).map(|r| Arc::clone(&r.handler))
    }

    /// Number of registered opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("opcodes", &self.entries.len()).finish()
    }
}
