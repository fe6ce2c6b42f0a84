//! The packet value type and its codec.

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    BufferPool, HEADER_SIZE, PacketFlags, PacketHeader, PayloadBuf, Priority, ProtocolError,
    Result, Transport,
};

/// A single protocol packet: dispatch header plus owned payload.
///
/// Packets are value-like. Cloning copies the payload bytes; dropping a
/// packet with a pooled payload returns the buffer to its pool exactly
/// once. Equality compares every header field and the payload bytes.
///
/// The `length` and `magic_number` wire fields are derived: `length` from
/// the payload size, `magic_number` from the protocol constant
/// [`MAGIC`](crate::MAGIC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    op_code: u16,
    flags: PacketFlags,
    priority: Priority,
    transport: Transport,
    payload: PayloadBuf,
}

impl Packet {
    /// Protocol-level type id of the built-in packet, used by the
    /// transformer registry.
    pub const TYPE_ID: u16 = 1;

    /// Create a packet with default flags and priority.
    #[must_use]
    pub fn new(op_code: u16, transport: Transport, payload: PayloadBuf) -> Self {
        Self { op_code, flags: PacketFlags::empty(), priority: Priority::Normal, transport, payload }
    }

    /// Create a sequenced packet whose payload starts with `sequence_id`.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` when `4 + body.len()` exceeds the
    /// payload limit.
    pub fn sequenced(
        op_code: u16,
        transport: Transport,
        sequence_id: u32,
        body: &[u8],
        pool: &Arc<BufferPool>,
    ) -> Result<Self> {
        let mut bytes = Vec::with_capacity(4 + body.len());
        bytes.extend_from_slice(&sequence_id.to_le_bytes());
        bytes.extend_from_slice(body);

        let mut packet = Self::new(op_code, transport, PayloadBuf::copy_from(&bytes, pool)?);
        packet.flags.insert(PacketFlags::SEQUENCED);
        Ok(packet)
    }

    /// Set the priority tier.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set additional flag bits.
    #[must_use]
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Handler selector.
    #[must_use]
    pub fn op_code(&self) -> u16 {
        self.op_code
    }

    /// Flag bits.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Set a flag bit. Transforms use this to toggle
    /// `ENCRYPTED`/`COMPRESSED`.
    pub fn set_flag(&mut self, flag: PacketFlags) {
        self.flags.insert(flag);
    }

    /// Clear a flag bit.
    pub fn clear_flag(&mut self, flag: PacketFlags) {
        self.flags.remove(flag);
    }

    /// Scheduling tier.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Transport this packet arrived on or will leave on.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Replace the payload, returning the previous buffer.
    ///
    /// Transforms decrypt/decompress into a fresh buffer and swap it in;
    /// the old buffer drops back to its pool at the call site.
    pub fn replace_payload(&mut self, payload: PayloadBuf) -> PayloadBuf {
        std::mem::replace(&mut self.payload, payload)
    }

    /// Sequence id, when the `SEQUENCED` flag is set and the payload
    /// carries at least four bytes.
    #[must_use]
    pub fn sequence_id(&self) -> Option<u32> {
        if !self.flags.contains(PacketFlags::SEQUENCED) {
            return None;
        }
        let bytes = self.payload.as_slice().get(..4)?;
        let mut id = [0u8; 4];
        id.copy_from_slice(bytes);
        Some(u32::from_le_bytes(id))
    }

    /// Total encoded size including the header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Build the wire header for this packet.
    pub fn header(&self) -> Result<PacketHeader> {
        PacketHeader::new(self.op_code, self.flags, self.priority, self.transport, self.payload.len())
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// Callers on the send path with small packets should prefer
    /// [`Packet::try_encode_into`] with a stack buffer; this allocating
    /// form is for packets past the stack threshold.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` when the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`](crate::MAX_PAYLOAD_SIZE).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(self.payload.as_slice());
        Ok(out)
    }

    /// Encode by appending to a growable buffer.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` when the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`](crate::MAX_PAYLOAD_SIZE).
    pub fn encode_to(&self, dst: &mut impl bytes::BufMut) -> Result<()> {
        let header = self.header()?;
        dst.put_slice(&header.to_bytes());
        dst.put_slice(self.payload.as_slice());
        Ok(())
    }

    /// Encode into a caller-provided buffer, returning the bytes written.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` on oversized payloads
    /// - `ProtocolError::NotEnoughSpace` when `dst` is too small
    pub fn try_encode_into(&self, dst: &mut [u8]) -> Result<usize> {
        let header = self.header()?;
        let needed = self.encoded_len();
        if dst.len() < needed {
            return Err(ProtocolError::NotEnoughSpace { needed, available: dst.len() });
        }

        dst[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        dst[HEADER_SIZE..needed].copy_from_slice(self.payload.as_slice());
        Ok(needed)
    }

    /// Decode a packet from wire bytes.
    ///
    /// Validates the header, then requires `length <= bytes.len()`; the
    /// payload is the `length - 11` bytes following the header. Trailing
    /// bytes past `length` are ignored, so datagram callers can pass a
    /// buffer with the identity suffix already stripped or not yet
    /// trimmed to size.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidLength` when the input is shorter than the
    ///   header, the length field is below the header size, or the length
    ///   field claims more bytes than are available
    /// - `ProtocolError::BadMagic` on a protocol-id mismatch
    /// - header field errors per [`PacketHeader::from_bytes`]
    pub fn decode(bytes: &[u8], pool: &Arc<BufferPool>) -> Result<Self> {
        let header = PacketHeader::from_bytes(bytes)?;

        let length = header.length();
        if length > bytes.len() {
            return Err(ProtocolError::InvalidLength { length, available: bytes.len() });
        }

        let payload = PayloadBuf::copy_from(&bytes[HEADER_SIZE..length], pool)?;

        Ok(Self {
            op_code: header.op_code(),
            flags: header.flags(),
            priority: header.priority(),
            transport: header.transport(),
            payload,
        })
    }

    /// Consume the packet, keeping its payload buffer.
    #[must_use]
    pub fn into_payload(self) -> PayloadBuf {
        self.payload
    }
}

// Hash mixes the header fields with up to 16 payload bytes (first and
// last 8) plus the payload length, keeping distribution reasonable
// without walking large payloads.
impl Hash for Packet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op_code.hash(state);
        self.flags.to_byte().hash(state);
        self.priority.to_byte().hash(state);
        self.transport.to_byte().hash(state);

        let payload = self.payload.as_slice();
        payload.len().hash(state);
        if payload.len() <= 16 {
            payload.hash(state);
        } else {
            payload[..8].hash(state);
            payload[payload.len() - 8..].hash(state);
        }
    }
}
