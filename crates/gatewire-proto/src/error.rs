//! Wire-format error types.
//!
//! Codec errors never cross the network boundary raw: the pipeline maps
//! them to control frames. These variants exist so that every rejection is
//! precise about what the peer got wrong.

use thiserror::Error;

/// Errors produced while encoding or decoding packets.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload would push the total packet size past the wire limit.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// Largest permitted payload size.
        max: usize,
    },

    /// The header `length` field is inconsistent with the input.
    ///
    /// Covers both `length < HEADER_SIZE` and `length > input.len()`.
    #[error("invalid length field: {length} (available {available})")]
    InvalidLength {
        /// Value of the `length` field.
        length: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Magic number at offset 0 does not match the configured protocol id.
    #[error("bad magic number: {found:#010x}")]
    BadMagic {
        /// Value found on the wire.
        found: u32,
    },

    /// Reserved flag bits were set.
    #[error("reserved flag bits set: {0:#010b}")]
    ReservedFlags(u8),

    /// Priority byte is outside the known enum set.
    #[error("unknown priority: {0}")]
    InvalidPriority(u8),

    /// Transport byte is neither TCP (1) nor UDP (2).
    #[error("unknown transport: {0}")]
    InvalidTransport(u8),

    /// Destination buffer is too small for `try_encode_into`.
    #[error("not enough space: need {needed} bytes, have {available}")]
    NotEnoughSpace {
        /// Bytes the encoded packet requires.
        needed: usize,
        /// Bytes the destination offers.
        available: usize,
    },

    /// A control-frame payload failed structural validation.
    #[error("malformed control frame: {0}")]
    MalformedControlFrame(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_detail() {
        let err = ProtocolError::PayloadTooLarge { size: 70_000, max: 65_524 };
        assert!(err.to_string().contains("70000"));

        let err = ProtocolError::BadMagic { found: 0xDEAD_BEEF };
        assert!(err.to_string().contains("0xdeadbeef"));
    }
}
