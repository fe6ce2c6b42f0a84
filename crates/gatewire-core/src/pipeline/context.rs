//! Per-packet context and handler attributes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use gatewire_crypto::CipherSuite;
use gatewire_proto::{BufferPool, Packet};
use tokio_util::sync::CancellationToken;

use crate::{gate::GateConfig, limiter::RatePolicy};

/// Facts about the peer a packet came from, snapshotted at dispatch.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer IP and port.
    pub endpoint: SocketAddr,
    /// Permission level granted to this connection (0-255).
    pub permission_level: u8,
    /// Negotiated packet encryption key; empty until negotiated.
    pub encryption_key: Vec<u8>,
    /// Negotiated cipher suite.
    pub cipher_suite: CipherSuite,
}

impl PeerInfo {
    /// Peer with no negotiated key and zero permissions.
    #[must_use]
    pub fn anonymous(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            permission_level: 0,
            encryption_key: Vec::new(),
            cipher_suite: CipherSuite::default(),
        }
    }
}

/// Attributes a handler declares about itself.
///
/// The pipeline reads these to drive every middleware: the rate stage
/// uses `rate_policy`, the permission stage `required_permission`, and so
/// on. Registration keys on `op_code`.
#[derive(Debug, Clone)]
pub struct HandlerAttributes {
    /// Opcode this handler serves.
    pub op_code: u16,
    /// Minimum connection permission level; 0 admits everyone.
    pub required_permission: u8,
    /// Rate policy; `None` falls back to the global endpoint limiter.
    pub rate_policy: Option<RatePolicy>,
    /// Concurrency bound; `None` leaves the opcode ungated.
    pub concurrency: Option<GateConfig>,
    /// Handler deadline; `None` runs without a timeout.
    pub timeout: Option<Duration>,
    /// Outbound packets from this handler must be encrypted.
    pub encrypted: bool,
    /// Compression threshold in bytes for outbound packets; 0 disables
    /// compression.
    pub compression_threshold: usize,
}

impl HandlerAttributes {
    /// Defaults for an opcode: open access, global rate limiting, no
    /// gate, no timeout, plaintext, compression above 512 bytes.
    #[must_use]
    pub fn for_op(op_code: u16) -> Self {
        Self {
            op_code,
            required_permission: 0,
            rate_policy: None,
            concurrency: None,
            timeout: None,
            encrypted: false,
            compression_threshold: 512,
        }
    }

    /// Require a permission level.
    #[must_use]
    pub fn require_permission(mut self, level: u8) -> Self {
        self.required_permission = level;
        self
    }

    /// Declare a rate policy.
    #[must_use]
    pub fn rate_limited(mut self, policy: RatePolicy) -> Self {
        self.rate_policy = Some(policy);
        self
    }

    /// Declare a concurrency bound.
    #[must_use]
    pub fn gated(mut self, config: GateConfig) -> Self {
        self.concurrency = Some(config);
        self
    }

    /// Declare a handler deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require outbound encryption.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Set the outbound compression threshold.
    #[must_use]
    pub fn compress_above(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

/// Everything a packet carries through the middleware chain.
///
/// The packet itself is replaceable: unwrap swaps in the decrypted and
/// decompressed payload as it runs. The context moves into the handler
/// once the inbound chain completes.
pub struct PacketContext {
    /// The packet under processing.
    pub packet: Packet,
    /// Peer facts.
    pub peer: PeerInfo,
    /// Attributes of the handler this packet selects.
    pub attributes: HandlerAttributes,
    /// Buffer pool for building response payloads.
    pub pool: Arc<BufferPool>,
    /// Cancellation for this dispatch. Inside a handler this is the
    /// timeout-linked child token.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketContext")
            .field("op_code", &self.packet.op_code())
            .field("endpoint", &self.peer.endpoint)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
