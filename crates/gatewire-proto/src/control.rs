//! Control frames: protocol-level status packets emitted by middlewares.
//!
//! A control frame rides the ordinary packet layout under the reserved
//! opcode [`CONTROL_OP`], with a fixed 21-byte payload. The encoding is
//! bit-exact and shared by every middleware so that a denial always looks
//! the same on the wire regardless of which stage produced it.

use std::sync::Arc;

use crate::{BufferPool, Packet, PayloadBuf, Priority, ProtocolError, Result, Transport};

/// Reserved opcode carrying control frames.
pub const CONTROL_OP: u16 = 0xFFFF;

/// Fixed size of the control-frame payload in bytes.
pub const CONTROL_PAYLOAD_SIZE: usize = 21;

/// Kind of control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    /// Request rejected.
    Fail = 0,
    /// Request rejected by rate limiting; retry after backoff.
    Throttle = 1,
    /// Handler exceeded its deadline.
    Timeout = 2,
}

impl ControlType {
    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Fail),
            1 => Ok(Self::Throttle),
            2 => Ok(Self::Timeout),
            _ => Err(ProtocolError::MalformedControlFrame("unknown control type")),
        }
    }
}

/// Why the frame was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlReason {
    /// No failure.
    Ok = 0,
    /// Rate limit or concurrency limit exceeded.
    RateLimited = 1,
    /// Permission level below the handler requirement.
    Unauthenticated = 2,
    /// No transformer is registered for the packet type.
    UnsupportedPacket = 3,
    /// Transformer lacks a decrypt/encrypt capability.
    CryptoUnsupported = 4,
    /// Transformer lacks a decompress/compress capability.
    CompressionUnsupported = 5,
    /// A transform ran and failed.
    TransformFailed = 6,
    /// Handler exceeded its deadline.
    Timeout = 7,
    /// Framing or length-field violation.
    MalformedPacket = 8,
    /// Unexpected server-side failure.
    InternalError = 9,
}

impl ControlReason {
    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Ok),
            1 => Ok(Self::RateLimited),
            2 => Ok(Self::Unauthenticated),
            3 => Ok(Self::UnsupportedPacket),
            4 => Ok(Self::CryptoUnsupported),
            5 => Ok(Self::CompressionUnsupported),
            6 => Ok(Self::TransformFailed),
            7 => Ok(Self::Timeout),
            8 => Ok(Self::MalformedPacket),
            9 => Ok(Self::InternalError),
            _ => Err(ProtocolError::MalformedControlFrame("unknown reason")),
        }
    }
}

/// What the peer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlAction {
    /// Nothing to do; the request is terminally rejected.
    None = 0,
    /// Retry after the indicated delay.
    Retry = 1,
    /// Retry with exponential backoff.
    BackoffRetry = 2,
}

impl ControlAction {
    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Retry),
            2 => Ok(Self::BackoffRetry),
            _ => Err(ProtocolError::MalformedControlFrame("unknown action")),
        }
    }
}

/// Control-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlFlags(u16);

impl ControlFlags {
    /// Condition is transient; the same request may later succeed.
    pub const IS_TRANSIENT: Self = Self(0b01);
    /// Peer should reduce its send rate.
    pub const SLOW_DOWN: Self = Self(0b10);

    /// Empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn to_bits(self) -> u16 {
        self.0
    }

    /// Construct from a raw wire value.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A decoded control frame.
///
/// Argument meaning depends on the reason: rate-limited frames carry the
/// retry delay in 100 ms steps in `arg1` and the remaining credit in
/// `arg2`; timeout frames carry `timeout_ms / 100` in `arg0`; permission
/// frames carry `(required, actual, op_code)` in `(arg0, arg1, arg2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    /// Kind of frame.
    pub control_type: ControlType,
    /// Why it was emitted.
    pub reason: ControlReason,
    /// Suggested peer behavior.
    pub action: ControlAction,
    /// Frame flag bits.
    pub flags: ControlFlags,
    /// Sequence id echoed from the offending packet, zero otherwise.
    pub sequence_id: u32,
    /// Reason-specific argument.
    pub arg0: u32,
    /// Reason-specific argument.
    pub arg1: u32,
    /// Reason-specific argument.
    pub arg2: u32,
}

impl ControlFrame {
    /// Frame with all arguments zeroed.
    #[must_use]
    pub fn new(control_type: ControlType, reason: ControlReason, action: ControlAction) -> Self {
        Self {
            control_type,
            reason,
            action,
            flags: ControlFlags::empty(),
            sequence_id: 0,
            arg0: 0,
            arg1: 0,
            arg2: 0,
        }
    }

    /// Set the flag bits.
    #[must_use]
    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Echo the offending packet's sequence id.
    #[must_use]
    pub fn with_sequence_id(mut self, sequence_id: u32) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    /// Set the reason-specific arguments.
    #[must_use]
    pub fn with_args(mut self, arg0: u32, arg1: u32, arg2: u32) -> Self {
        self.arg0 = arg0;
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    /// Serialize the 21-byte control payload.
    #[must_use]
    pub fn encode_payload(&self) -> [u8; CONTROL_PAYLOAD_SIZE] {
        let mut out = [0u8; CONTROL_PAYLOAD_SIZE];
        out[0] = self.control_type as u8;
        out[1] = self.reason as u8;
        out[2] = self.action as u8;
        out[3..5].copy_from_slice(&self.flags.to_bits().to_le_bytes());
        out[5..9].copy_from_slice(&self.sequence_id.to_le_bytes());
        out[9..13].copy_from_slice(&self.arg0.to_le_bytes());
        out[13..17].copy_from_slice(&self.arg1.to_le_bytes());
        out[17..21].copy_from_slice(&self.arg2.to_le_bytes());
        out
    }

    /// Parse a control payload.
    ///
    /// # Errors
    ///
    /// `ProtocolError::MalformedControlFrame` on a short payload or an
    /// unknown discriminant.
    pub fn decode_payload(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_PAYLOAD_SIZE {
            return Err(ProtocolError::MalformedControlFrame("payload too short"));
        }

        let u16_at = |offset: usize| {
            let mut v = [0u8; 2];
            v.copy_from_slice(&bytes[offset..offset + 2]);
            u16::from_le_bytes(v)
        };
        let u32_at = |offset: usize| {
            let mut v = [0u8; 4];
            v.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(v)
        };

        Ok(Self {
            control_type: ControlType::from_wire(bytes[0])?,
            reason: ControlReason::from_wire(bytes[1])?,
            action: ControlAction::from_wire(bytes[2])?,
            flags: ControlFlags::from_bits(u16_at(3)),
            sequence_id: u32_at(5),
            arg0: u32_at(9),
            arg1: u32_at(13),
            arg2: u32_at(17),
        })
    }

    /// Wrap the frame in a packet bound for `transport`.
    pub fn into_packet(self, transport: Transport, pool: &Arc<BufferPool>) -> Result<Packet> {
        let payload = PayloadBuf::copy_from(&self.encode_payload(), pool)?;
        Ok(Packet::new(CONTROL_OP, transport, payload).with_priority(Priority::Urgent))
    }

    /// Parse a control frame out of a received packet.
    ///
    /// # Errors
    ///
    /// `ProtocolError::MalformedControlFrame` when the packet does not
    /// carry [`CONTROL_OP`] or its payload fails to parse.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.op_code() != CONTROL_OP {
            return Err(ProtocolError::MalformedControlFrame("not a control opcode"));
        }
        Self::decode_payload(packet.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let frame = ControlFrame::new(
            ControlType::Throttle,
            ControlReason::RateLimited,
            ControlAction::Retry,
        )
        .with_flags(ControlFlags::IS_TRANSIENT.union(ControlFlags::SLOW_DOWN))
        .with_sequence_id(0x0102_0304)
        .with_args(1, 2, 3);

        let decoded = ControlFrame::decode_payload(&frame.encode_payload()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn payload_layout_is_little_endian() {
        let frame = ControlFrame::new(ControlType::Fail, ControlReason::Timeout, ControlAction::None)
            .with_args(0xAABB_CCDD, 0, 0);
        let bytes = frame.encode_payload();

        assert_eq!(bytes[0], 0); // FAIL
        assert_eq!(bytes[1], 7); // TIMEOUT
        assert_eq!(bytes[2], 0); // NONE
        assert_eq!(&bytes[9..13], &0xAABB_CCDDu32.to_le_bytes());
    }

    #[test]
    fn reject_unknown_discriminants() {
        let mut bytes =
            ControlFrame::new(ControlType::Fail, ControlReason::Ok, ControlAction::None)
                .encode_payload();
        bytes[0] = 9;
        assert!(ControlFrame::decode_payload(&bytes).is_err());

        bytes[0] = 0;
        bytes[1] = 200;
        assert!(ControlFrame::decode_payload(&bytes).is_err());

        bytes[1] = 0;
        bytes[2] = 7;
        assert!(ControlFrame::decode_payload(&bytes).is_err());
    }

    #[test]
    fn reject_short_payload() {
        assert!(ControlFrame::decode_payload(&[0u8; CONTROL_PAYLOAD_SIZE - 1]).is_err());
    }

    #[test]
    fn packet_round_trip_preserves_frame() {
        let pool = BufferPool::with_defaults();
        let frame =
            ControlFrame::new(ControlType::Timeout, ControlReason::Timeout, ControlAction::Retry)
                .with_args(5, 0, 0);

        let packet = frame.into_packet(Transport::Tcp, &pool).unwrap();
        assert_eq!(packet.op_code(), CONTROL_OP);
        assert_eq!(packet.priority(), Priority::Urgent);

        let parsed = ControlFrame::from_packet(&packet).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn from_packet_requires_control_opcode() {
        let packet = Packet::new(0x10, Transport::Tcp, PayloadBuf::empty());
        assert!(ControlFrame::from_packet(&packet).is_err());
    }
}
