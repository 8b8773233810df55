//! Connection identifiers.

use bytes::{Buf, BufMut, Bytes};
use rand::RngCore;
use std::fmt;

use super::error::PacketError;

/// Maximum length of a connection ID
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Length used for locally generated connection IDs
pub const DEFAULT_CONNECTION_ID_LENGTH: usize = 8;

/// Opaque connection identifier, 0 to 20 bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    /// Generate a random connection ID of the default length
    pub fn random() -> Self {
        Self::random_with_len(DEFAULT_CONNECTION_ID_LENGTH)
    }

    /// Generate a random connection ID; `len` is clamped to the maximum.
    pub fn random_with_len(len: usize) -> Self {
        let mut data = vec![0u8; len.min(MAX_CONNECTION_ID_LENGTH)];
        rand::thread_rng().fill_bytes(&mut data);
        Self(Bytes::from(data))
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self, PacketError> {
        let data = data.into();
        if data.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(PacketError::InvalidConnectionIdLength(data.len()));
        }
        Ok(Self(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read a one-byte length followed by the ID bytes.
    pub(crate) fn read_with_len<B: Buf>(buf: &mut B) -> Result<Self, PacketError> {
        if !buf.has_remaining() {
            return Err(PacketError::IncompleteData);
        }
        let len = buf.get_u8() as usize;
        Self::read(buf, len)
    }

    /// Read exactly `len` bytes.
    pub(crate) fn read<B: Buf>(buf: &mut B, len: usize) -> Result<Self, PacketError> {
        if len > MAX_CONNECTION_ID_LENGTH {
            return Err(PacketError::InvalidConnectionIdLength(len));
        }
        if buf.remaining() < len {
            return Err(PacketError::IncompleteData);
        }
        Ok(Self(buf.copy_to_bytes(len)))
    }

    pub(crate) fn write_with_len<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.0.len() as u8);
        buf.put_slice(&self.0);
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        let a = ConnectionId::random();
        let b = ConnectionId::random();
        assert_ne!(a, b);
        assert_eq!(a.len(), DEFAULT_CONNECTION_ID_LENGTH);
        assert_eq!(ConnectionId::random_with_len(64).len(), MAX_CONNECTION_ID_LENGTH);
    }

    #[test]
    fn test_length_limit() {
        assert!(ConnectionId::from_bytes(vec![0u8; 20]).is_ok());
        assert_eq!(
            ConnectionId::from_bytes(vec![0u8; 21]),
            Err(PacketError::InvalidConnectionIdLength(21))
        );
    }

    #[test]
    fn test_display_is_hex() {
        let cid = ConnectionId::from_bytes(vec![0x01, 0xab]).unwrap();
        assert_eq!(cid.to_string(), "01ab");
    }
}
