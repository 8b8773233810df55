use bytes::{Buf, BufMut};
use std::fmt;

use super::error::PacketError;

/// Four-byte protocol version identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u32);

impl Version {
    /// Reserved value marking a version negotiation packet
    pub const NEGOTIATION: Version = Version(0x0000_0000);
    pub const FINAL: Version = Version(0x0000_0001);
    pub const DRAFT_17: Version = Version(0xff00_0011);
    /// The only version this implementation speaks
    pub const CURRENT: Version = Version::DRAFT_17;

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_negotiation(&self) -> bool {
        *self == Version::NEGOTIATION
    }

    pub fn is_supported(&self) -> bool {
        supported_versions().contains(self)
    }

    pub(crate) fn read<B: Buf>(buf: &mut B) -> Result<Self, PacketError> {
        if buf.remaining() < 4 {
            return Err(PacketError::IncompleteData);
        }
        Ok(Self(buf.get_u32()))
    }

    pub(crate) fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.0);
    }
}

/// Versions offered in version negotiation, in preference order.
pub fn supported_versions() -> &'static [Version] {
    &[Version::CURRENT]
}

impl Default for Version {
    fn default() -> Self {
        Version::CURRENT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported() {
        assert!(Version::CURRENT.is_supported());
        assert!(!Version::FINAL.is_supported());
        assert!(Version::NEGOTIATION.is_negotiation());
        assert_eq!(Version::DRAFT_17.to_string(), "0xff000011");
    }
}
