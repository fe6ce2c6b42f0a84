//! Packet header with zero-copy parsing.
//!
//! The `PacketHeader` is a fixed 11-byte structure serialized as raw binary
//! (little-endian). Casting it straight out of a receive buffer lets the
//! read loop decide how many payload bytes to pull without any
//! deserialization pass.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    HEADER_SIZE, MAGIC, MAX_PACKET_SIZE, PacketFlags, Priority, ProtocolError, Result, Transport,
};

/// Fixed 11-byte packet header (little-endian).
///
/// Multi-byte integers are stored as raw byte arrays to avoid alignment
/// issues with the packed layout. Field offsets are a normative part of the
/// wire format.
///
/// The `#[repr(C, packed)]` layout with zerocopy traits means any 11-byte
/// pattern is a structurally valid struct, so casting untrusted network
/// bytes cannot cause undefined behavior. Semantic validation (magic,
/// reserved flags, priority, transport, length) happens after the cast in
/// [`PacketHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    // Protocol identification (bytes 0-3)
    magic: [u8; 4],

    // Dispatch (bytes 4-6)
    opcode: [u8; 2], // u16 handler selector
    flags: u8,       // PacketFlags bitfield

    // Scheduling and routing (bytes 7-8)
    priority: u8,
    transport: u8, // 1=TCP 2=UDP

    // Framing (bytes 9-10)
    length: [u8; 2], // u16 total bytes including header
}

impl PacketHeader {
    /// Size of the serialized header (11 bytes).
    pub const SIZE: usize = HEADER_SIZE;

    /// Build a header for a payload of `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` when the total size would exceed
    /// [`MAX_PACKET_SIZE`](crate::MAX_PACKET_SIZE).
    pub fn new(
        op_code: u16,
        flags: PacketFlags,
        priority: Priority,
        transport: Transport,
        payload_len: usize,
    ) -> Result<Self> {
        let total = Self::SIZE + payload_len;
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: crate::MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            magic: MAGIC.to_le_bytes(),
            opcode: op_code.to_le_bytes(),
            flags: flags.to_byte(),
            priority: priority.to_byte(),
            transport: transport.to_byte(),
            length: (total as u16).to_le_bytes(),
        })
    }

    /// Parse a header from untrusted network bytes (zero-copy).
    ///
    /// Validation order runs cheapest-first: buffer size, magic, reserved
    /// flags, priority, transport, then the length field's lower bound.
    /// The upper bound (`length <= bytes.len()`) is the caller's check,
    /// since stream readers validate it against bytes still in flight.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidLength` when fewer than 11 bytes are
    ///   available or the length field is below the header size
    /// - `ProtocolError::BadMagic` on a protocol-id mismatch
    /// - `ProtocolError::ReservedFlags` when reserved flag bits are set
    /// - `ProtocolError::InvalidPriority` / `InvalidTransport` on unknown
    ///   discriminants
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::InvalidLength { length: Self::SIZE, available: bytes.len() })?
            .0;

        if u32::from_le_bytes(header.magic) != MAGIC {
            return Err(ProtocolError::BadMagic { found: u32::from_le_bytes(header.magic) });
        }

        if PacketFlags::from_wire(header.flags).is_none() {
            return Err(ProtocolError::ReservedFlags(header.flags));
        }

        Priority::from_wire(header.priority)?;
        Transport::from_wire(header.transport)?;

        let length = u16::from_le_bytes(header.length) as usize;
        if length < Self::SIZE {
            return Err(ProtocolError::InvalidLength { length, available: bytes.len() });
        }

        Ok(header)
    }

    /// Serialize the header to its 11 wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_le_bytes(self.magic)
    }

    /// Handler selector.
    #[must_use]
    pub fn op_code(&self) -> u16 {
        u16::from_le_bytes(self.opcode)
    }

    /// Packet flag bits.
    ///
    /// Headers produced by [`PacketHeader::from_bytes`] never carry
    /// reserved bits, so the raw byte is taken as-is.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_byte(self.flags)
    }

    /// Scheduling tier. Falls back to `Normal` for unvalidated headers.
    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority::from_wire(self.priority).unwrap_or_default()
    }

    /// Transport discriminator. Falls back to `Tcp` for unvalidated headers.
    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::from_wire(self.transport).unwrap_or(Transport::Tcp)
    }

    /// Total packet length including the header.
    #[must_use]
    pub fn length(&self) -> usize {
        u16::from_le_bytes(self.length) as usize
    }

    /// Payload length implied by the `length` field.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.length().saturating_sub(Self::SIZE)
    }
}

// Manual Debug implementation (can't derive field access on packed repr)
impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("magic", &format_args!("{:#010x}", self.magic()))
            .field("op_code", &format_args!("{:#06x}", self.op_code()))
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .field("transport", &self.transport())
            .field("length", &self.length())
            .finish()
    }
}

impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header_bytes() -> [u8; HEADER_SIZE] {
        let header = PacketHeader::new(
            0x0001,
            PacketFlags::empty(),
            Priority::Normal,
            Transport::Tcp,
            5,
        )
        .unwrap();
        header.to_bytes()
    }

    #[test]
    fn header_size_is_eleven_bytes() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
        assert_eq!(PacketHeader::SIZE, 11);
    }

    #[test]
    fn encode_is_little_endian_at_fixed_offsets() {
        let bytes = valid_header_bytes();
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..6], &0x0001u16.to_le_bytes());
        assert_eq!(bytes[6], 0);
        assert_eq!(bytes[7], 1); // Normal
        assert_eq!(bytes[8], 1); // TCP
        assert_eq!(&bytes[9..11], &16u16.to_le_bytes()); // 11 + 5
    }

    #[test]
    fn round_trip_preserves_fields() {
        let bytes = valid_header_bytes();
        let header = PacketHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.magic(), MAGIC);
        assert_eq!(header.op_code(), 0x0001);
        assert_eq!(header.length(), 16);
        assert_eq!(header.payload_len(), 5);
    }

    #[test]
    fn reject_short_buffer() {
        let bytes = valid_header_bytes();
        let result = PacketHeader::from_bytes(&bytes[..10]);
        assert_eq!(result, Err(ProtocolError::InvalidLength { length: 11, available: 10 }));
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes = valid_header_bytes();
        bytes[0] = 0xFF;
        assert!(matches!(PacketHeader::from_bytes(&bytes), Err(ProtocolError::BadMagic { .. })));
    }

    #[test]
    fn reject_reserved_flags() {
        let mut bytes = valid_header_bytes();
        bytes[6] = 0b0001_0000;
        assert_eq!(
            PacketHeader::from_bytes(&bytes),
            Err(ProtocolError::ReservedFlags(0b0001_0000))
        );
    }

    #[test]
    fn reject_unknown_priority_and_transport() {
        let mut bytes = valid_header_bytes();
        bytes[7] = 9;
        assert_eq!(PacketHeader::from_bytes(&bytes), Err(ProtocolError::InvalidPriority(9)));

        let mut bytes = valid_header_bytes();
        bytes[8] = 0;
        assert_eq!(PacketHeader::from_bytes(&bytes), Err(ProtocolError::InvalidTransport(0)));
    }

    #[test]
    fn reject_length_below_header_size() {
        let mut bytes = valid_header_bytes();
        bytes[9..11].copy_from_slice(&5u16.to_le_bytes());
        assert!(matches!(
            PacketHeader::from_bytes(&bytes),
            Err(ProtocolError::InvalidLength { length: 5, .. })
        ));
    }

    #[test]
    fn oversized_payload_rejected_at_construction() {
        let result = PacketHeader::new(
            1,
            PacketFlags::empty(),
            Priority::Normal,
            Transport::Tcp,
            crate::MAX_PAYLOAD_SIZE + 1,
        );
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }
}
