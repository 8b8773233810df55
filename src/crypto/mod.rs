//! Packet protection: HKDF key schedule and AEAD wrappers.

pub mod aead;
pub mod hkdf;
pub mod key_schedule;

pub use aead::{Aead, AeadSet, DirectionalKeys};
pub use key_schedule::{HandshakeSecrets, handshake_aead, initial_aead, one_rtt_aead};

/// Encryption level for QUIC packets. Each level has its own keys and its
/// own packet number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    pub const ALL: [EncryptionLevel; 3] = [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}
