//! Packet flag bitset.

/// Per-packet flag bits at header offset 6.
///
/// Bits 0-2 are assigned; bits 3-7 are reserved and must be zero on the
/// wire. [`PacketFlags::from_wire`] enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Payload is encrypted.
    pub const ENCRYPTED: Self = Self(0b0000_0001);
    /// Payload is compressed.
    pub const COMPRESSED: Self = Self(0b0000_0010);
    /// First four payload bytes carry a sequence id.
    pub const SEQUENCED: Self = Self(0b0000_0100);

    /// Mask of all reserved bits.
    pub const RESERVED_MASK: u8 = 0b1111_1000;

    /// Empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Construct from a raw byte without validation.
    ///
    /// Use [`PacketFlags::from_wire`] for untrusted input.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Construct from an untrusted wire byte.
    ///
    /// Returns `None` when any reserved bit is set.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        if byte & Self::RESERVED_MASK != 0 { None } else { Some(Self(byte)) }
    }

    /// Raw byte value.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set the given bits.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the given bits.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PacketFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut put = |f: &mut std::fmt::Formatter<'_>, name: &str| -> std::fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };

        if self.contains(Self::ENCRYPTED) {
            put(f, "ENCRYPTED")?;
        }
        if self.contains(Self::COMPRESSED) {
            put(f, "COMPRESSED")?;
        }
        if self.contains(Self::SEQUENCED) {
            put(f, "SEQUENCED")?;
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}
