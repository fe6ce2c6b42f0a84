//! Gatewire wire format.
//!
//! Defines the fixed-layout binary packet that every gatewire transport
//! carries: an 11-byte little-endian header followed by up to 65,524 bytes
//! of payload. The header is parsed zero-copy from untrusted bytes; payload
//! bytes are owned by the packet through an inline-or-pooled buffer so that
//! hot-path packets never touch the allocator.
//!
//! # Wire layout
//!
//! ```text
//! offset  size  field
//! 0       4     magic_number (u32 LE)
//! 4       2     op_code      (u16 LE)
//! 6       1     flags        bit0=ENCRYPTED bit1=COMPRESSED bit2=SEQUENCED
//! 7       1     priority
//! 8       1     transport    1=TCP 2=UDP
//! 9       2     length       (u16 LE, total bytes including header)
//! 11      N     payload      (0..=65524 bytes)
//! ```
//!
//! For sequenced packets the first four payload bytes hold a `u32` LE
//! sequence id.
//!
//! # Invariants
//!
//! - `length == HEADER_SIZE + payload.len()` for every encoded packet.
//! - `magic_number` equals [`MAGIC`]; any other value is a fatal parse
//!   error.
//! - Reserved flag bits are zero on the wire.
//! - A pooled payload buffer is returned to its pool exactly once, on drop.

#![forbid(unsafe_code)]

mod control;
mod error;
mod flags;
mod header;
mod packet;
mod payload;
mod types;

pub use control::{
    CONTROL_OP, CONTROL_PAYLOAD_SIZE, ControlAction, ControlFlags, ControlFrame, ControlReason,
    ControlType,
};
pub use error::ProtocolError;
pub use flags::PacketFlags;
pub use header::PacketHeader;
pub use packet::Packet;
pub use payload::{BufferPool, INLINE_CAPACITY, PayloadBuf, PooledBuf};
pub use types::{Priority, Transport};

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol identifier at offset 0 of every packet (little-endian).
pub const MAGIC: u32 = 0xC0DE_B0BA;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Maximum total packet size (header + payload): 64 KiB minus one.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Number of trailing identity bytes on every UDP datagram.
pub const IDENTIFIER_SIZE: usize = 7;

/// Opaque logical-connection identity carried by UDP datagrams.
///
/// TCP connections are assigned one on accept; UDP peers present theirs as
/// the trailing [`IDENTIFIER_SIZE`] bytes of each datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier(
    /// Raw identity bytes.
    pub [u8; IDENTIFIER_SIZE],
);

impl Identifier {
    /// Read an identifier from the trailing bytes of a datagram.
    ///
    /// Returns `None` when `datagram` is shorter than [`IDENTIFIER_SIZE`].
    #[must_use]
    pub fn from_trailing(datagram: &[u8]) -> Option<Self> {
        let start = datagram.len().checked_sub(IDENTIFIER_SIZE)?;
        let mut id = [0u8; IDENTIFIER_SIZE];
        id.copy_from_slice(&datagram[start..]);
        Some(Self(id))
    }

    /// Raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
