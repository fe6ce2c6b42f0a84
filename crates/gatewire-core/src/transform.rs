//! Per-packet-type transform capability table.
//!
//! Each packet type id maps to a [`TransformSet`]: four optional
//! transforms over payload bytes. The set owns the packet mechanics —
//! rebuilding the payload buffer and toggling the `ENCRYPTED`/`COMPRESSED`
//! flags — so registered closures stay pure byte-to-byte functions.
//! `op_code`, `transport`, and `priority` are preserved by construction.

use std::{collections::HashMap, sync::Arc};

use gatewire_crypto::CipherSuite;
use gatewire_proto::{BufferPool, MAX_PAYLOAD_SIZE, Packet, PacketFlags, PayloadBuf, ProtocolError};
use thiserror::Error;

/// Errors surfaced by a transform.
///
/// The pipeline never forwards these raw; they map onto `FAIL` control
/// frames (`TRANSFORM_FAILED` for the first three, the capability-specific
/// reasons for [`TransformError::MissingCapability`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// AEAD seal/open failure.
    #[error(transparent)]
    Aead(#[from] gatewire_crypto::AeadError),

    /// Compression or decompression failure.
    #[error(transparent)]
    Compress(#[from] gatewire_crypto::CompressError),

    /// Transformed payload no longer fits the wire format.
    #[error(transparent)]
    Payload(#[from] ProtocolError),

    /// The set has no transform registered for the requested direction.
    #[error("transform not supported: {0}")]
    MissingCapability(&'static str),
}

type Result<T> = std::result::Result<T, TransformError>;

/// Byte-level encrypt/decrypt transform.
pub type CryptoFn =
    Arc<dyn Fn(&[u8], &[u8], CipherSuite) -> Result<Vec<u8>> + Send + Sync + 'static>;

/// Byte-level compress/decompress transform.
pub type CodecFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static>;

/// The four optional transforms for one packet type.
#[derive(Clone, Default)]
pub struct TransformSet {
    encrypt: Option<CryptoFn>,
    decrypt: Option<CryptoFn>,
    compress: Option<CodecFn>,
    decompress: Option<CodecFn>,
}

impl TransformSet {
    /// Empty set with no capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the encrypt transform.
    #[must_use]
    pub fn with_encrypt(mut self, f: CryptoFn) -> Self {
        self.encrypt = Some(f);
        self
    }

    /// Set the decrypt transform.
    #[must_use]
    pub fn with_decrypt(mut self, f: CryptoFn) -> Self {
        self.decrypt = Some(f);
        self
    }

    /// Set the compress transform.
    #[must_use]
    pub fn with_compress(mut self, f: CodecFn) -> Self {
        self.compress = Some(f);
        self
    }

    /// Set the decompress transform.
    #[must_use]
    pub fn with_decompress(mut self, f: CodecFn) -> Self {
        self.decompress = Some(f);
        self
    }

    /// Full set wired to the built-in AEAD and DEFLATE implementations.
    #[must_use]
    pub fn defaults() -> Self {
        Self::new()
            .with_encrypt(Arc::new(|payload, key, suite| {
                Ok(gatewire_crypto::seal(suite, key, payload)?)
            }))
            .with_decrypt(Arc::new(|payload, key, suite| {
                Ok(gatewire_crypto::open(suite, key, payload)?)
            }))
            .with_compress(Arc::new(|payload| Ok(gatewire_crypto::compress(payload)?)))
            .with_decompress(Arc::new(|payload| {
                Ok(gatewire_crypto::decompress(payload, MAX_PAYLOAD_SIZE)?)
            }))
    }

    /// Whether an encrypt transform is registered.
    #[must_use]
    pub fn has_encrypt(&self) -> bool {
        self.encrypt.is_some()
    }

    /// Whether a decrypt transform is registered.
    #[must_use]
    pub fn has_decrypt(&self) -> bool {
        self.decrypt.is_some()
    }

    /// Whether a compress transform is registered.
    #[must_use]
    pub fn has_compress(&self) -> bool {
        self.compress.is_some()
    }

    /// Whether a decompress transform is registered.
    #[must_use]
    pub fn has_decompress(&self) -> bool {
        self.decompress.is_some()
    }

    /// Encrypt the payload and set the `ENCRYPTED` flag.
    pub fn encrypt(
        &self,
        mut packet: Packet,
        key: &[u8],
        suite: CipherSuite,
        pool: &Arc<BufferPool>,
    ) -> Result<Packet> {
        let f = self.encrypt.as_ref().ok_or(TransformError::MissingCapability("encrypt"))?;
        let bytes = f(packet.payload(), key, suite)?;
        packet.replace_payload(PayloadBuf::copy_from(&bytes, pool)?);
        packet.set_flag(PacketFlags::ENCRYPTED);
        Ok(packet)
    }

    /// Decrypt the payload and clear the `ENCRYPTED` flag.
    pub fn decrypt(
        &self,
        mut packet: Packet,
        key: &[u8],
        suite: CipherSuite,
        pool: &Arc<BufferPool>,
    ) -> Result<Packet> {
        let f = self.decrypt.as_ref().ok_or(TransformError::MissingCapability("decrypt"))?;
        let bytes = f(packet.payload(), key, suite)?;
        packet.replace_payload(PayloadBuf::copy_from(&bytes, pool)?);
        packet.clear_flag(PacketFlags::ENCRYPTED);
        Ok(packet)
    }

    /// Compress the payload and set the `COMPRESSED` flag.
    pub fn compress(&self, mut packet: Packet, pool: &Arc<BufferPool>) -> Result<Packet> {
        let f = self.compress.as_ref().ok_or(TransformError::MissingCapability("compress"))?;
        let bytes = f(packet.payload())?;
        packet.replace_payload(PayloadBuf::copy_from(&bytes, pool)?);
        packet.set_flag(PacketFlags::COMPRESSED);
        Ok(packet)
    }

    /// Decompress the payload and clear the `COMPRESSED` flag.
    pub fn decompress(&self, mut packet: Packet, pool: &Arc<BufferPool>) -> Result<Packet> {
        let f = self.decompress.as_ref().ok_or(TransformError::MissingCapability("decompress"))?;
        let bytes = f(packet.payload())?;
        packet.replace_payload(PayloadBuf::copy_from(&bytes, pool)?);
        packet.clear_flag(PacketFlags::COMPRESSED);
        Ok(packet)
    }
}

impl std::fmt::Debug for TransformSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSet")
            .field("encrypt", &self.has_encrypt())
            .field("decrypt", &self.has_decrypt())
            .field("compress", &self.has_compress())
            .field("decompress", &self.has_decompress())
            .finish()
    }
}

/// Registry mapping packet type ids to transform sets.
#[derive(Debug)]
pub struct TransformRegistry {
    entries: HashMap<u16, TransformSet>,
}

impl TransformRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Registry with the built-in packet type wired to the default
    /// transforms.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Packet::TYPE_ID, TransformSet::defaults());
        registry
    }

    /// Register (or replace) the transform set for a packet type.
    pub fn register(&mut self, type_id: u16, set: TransformSet) {
        self.entries.insert(type_id, set);
    }

    /// Transform set for a packet type, when one is registered.
    #[must_use]
    pub fn get(&self, type_id: u16) -> Option<&TransformSet> {
        self.entries.get(&type_id)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
