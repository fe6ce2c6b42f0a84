//! Priority and transport enums carried in the packet header.

use crate::{ProtocolError, Result};

/// Scheduling tier at header offset 7.
///
/// Parsed and carried on every packet; the pipeline itself does not
/// schedule by priority, higher layers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Background traffic.
    Low = 0,
    /// Default tier.
    #[default]
    Normal = 1,
    /// Latency-sensitive traffic.
    High = 2,
    /// Control-plane traffic.
    Urgent = 3,
}

impl Priority {
    /// Parse an untrusted wire byte.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(ProtocolError::InvalidPriority(other)),
        }
    }

    /// Raw wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Transport discriminator at header offset 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Transport {
    /// Stream transport, length-prefixed framing.
    Tcp = 1,
    /// Datagram transport, one packet per datagram.
    Udp = 2,
}

impl Transport {
    /// Parse an untrusted wire byte.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Udp),
            other => Err(ProtocolError::InvalidTransport(other)),
        }
    }

    /// Raw wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trip() {
        for byte in 0..=3u8 {
            let priority = Priority::from_wire(byte).unwrap();
            assert_eq!(priority.to_byte(), byte);
        }
        assert_eq!(Priority::from_wire(4), Err(ProtocolError::InvalidPriority(4)));
    }

    #[test]
    fn transport_round_trip() {
        assert_eq!(Transport::from_wire(1).unwrap(), Transport::Tcp);
        assert_eq!(Transport::from_wire(2).unwrap(), Transport::Udp);
        assert_eq!(Transport::from_wire(0), Err(ProtocolError::InvalidTransport(0)));
        assert_eq!(Transport::from_wire(3), Err(ProtocolError::InvalidTransport(3)));
    }
}
