use ring::aead::{quic, Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use std::fmt;
use std::sync::Arc;

use super::EncryptionLevel;
use crate::quic::error::{CryptoError, ProtocolError};
use crate::quic::packet::PacketNumber;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 12;
/// Authentication tag appended to every sealed payload
pub const TAG_LEN: usize = 16;
/// Ciphertext bytes sampled for the header protection mask
pub const SAMPLE_LEN: usize = 16;

/// Key, IV and header protection key for one direction.
#[derive(Clone, PartialEq, Eq)]
pub struct DirectionalKeys {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub hp: [u8; KEY_LEN],
}

struct Direction {
    material: DirectionalKeys,
    key: LessSafeKey,
    hp: quic::HeaderProtectionKey,
}

impl Direction {
    fn new(material: DirectionalKeys) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_128_GCM, &material.key)
            .map_err(|_| CryptoError::KeyDerivation("aead key".into()))?;
        let hp = quic::HeaderProtectionKey::new(&quic::AES_128, &material.hp)
            .map_err(|_| CryptoError::KeyDerivation("header protection key".into()))?;
        Ok(Self {
            material,
            key: LessSafeKey::new(unbound),
            hp,
        })
    }

    fn nonce(&self, pn: PacketNumber) -> Nonce {
        let mut nonce = self.material.iv;
        for (i, b) in pn.value().to_be_bytes().iter().enumerate() {
            nonce[IV_LEN - 8 + i] ^= b;
        }
        Nonce::assume_unique_for_key(nonce)
    }

    fn mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        if sample.len() < SAMPLE_LEN {
            return Err(CryptoError::HeaderProtection(format!(
                "sample of {} bytes",
                sample.len()
            )));
        }
        self.hp
            .new_mask(&sample[..SAMPLE_LEN])
            .map_err(|_| CryptoError::HeaderProtection("mask".into()))
    }
}

/// Packet protection for one encryption level: a seal direction and an
/// open direction. Client and server hold mirrored instances.
pub struct Aead {
    seal: Direction,
    open: Direction,
}

impl Aead {
    pub fn new(seal: DirectionalKeys, open: DirectionalKeys) -> Result<Self, CryptoError> {
        Ok(Self {
            seal: Direction::new(seal)?,
            open: Direction::new(open)?,
        })
    }

    /// Encrypt `plaintext`, returning ciphertext with the tag appended.
    pub fn seal(
        &self,
        plaintext: &[u8],
        pn: PacketNumber,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut in_out = plaintext.to_vec();
        self.seal
            .key
            .seal_in_place_append_tag(self.seal.nonce(pn), Aad::from(associated_data), &mut in_out)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(in_out)
    }

    /// Decrypt and authenticate. Failure means the packet must be dropped.
    pub fn open(
        &self,
        ciphertext: &[u8],
        pn: PacketNumber,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut in_out = ciphertext.to_vec();
        let plaintext_len = self
            .open
            .key
            .open_in_place(self.open.nonce(pn), Aad::from(associated_data), &mut in_out)
            .map_err(|_| CryptoError::Decryption)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    pub fn seal_header_mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        self.seal.mask(sample)
    }

    pub fn open_header_mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        self.open.mask(sample)
    }

    pub fn seal_keys(&self) -> &DirectionalKeys {
        &self.seal.material
    }

    pub fn open_keys(&self) -> &DirectionalKeys {
        &self.open.material
    }
}

impl fmt::Debug for Aead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material stays out of logs
        f.debug_struct("Aead").finish_non_exhaustive()
    }
}

/// AEADs for all three encryption levels. Initial is always present; the
/// others are installed as the handshake progresses.
#[derive(Debug, Clone)]
pub struct AeadSet {
    initial: Arc<Aead>,
    handshake: Option<Arc<Aead>>,
    one_rtt: Option<Arc<Aead>>,
}

impl AeadSet {
    pub fn new(initial: Aead) -> Self {
        Self {
            initial: Arc::new(initial),
            handshake: None,
            one_rtt: None,
        }
    }

    pub fn get(&self, level: EncryptionLevel) -> Result<Arc<Aead>, ProtocolError> {
        match level {
            EncryptionLevel::Initial => Some(self.initial.clone()),
            EncryptionLevel::Handshake => self.handshake.clone(),
            EncryptionLevel::OneRtt => self.one_rtt.clone(),
        }
        .ok_or(ProtocolError::MissingAead(level))
    }

    pub fn is_available(&self, level: EncryptionLevel) -> bool {
        self.get(level).is_ok()
    }

    pub fn set_handshake(&mut self, aead: Aead) {
        self.handshake = Some(Arc::new(aead));
    }

    pub fn set_one_rtt(&mut self, aead: Aead) {
        self.one_rtt = Some(Arc::new(aead));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_schedule;
    use crate::quic::connection_id::ConnectionId;

    fn pair() -> (Aead, Aead) {
        let cid = ConnectionId::random();
        (
            key_schedule::initial_aead(&cid, true).unwrap(),
            key_schedule::initial_aead(&cid, false).unwrap(),
        )
    }

    #[test]
    fn test_seal_open_between_roles() {
        let (client, server) = pair();
        let pn = PacketNumber::new(7);
        let sealed = client.seal(b"hello", pn, b"header").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_LEN);
        assert_eq!(server.open(&sealed, pn, b"header").unwrap(), b"hello");
    }

    #[test]
    fn test_open_rejects_wrong_inputs() {
        let (client, server) = pair();
        let pn = PacketNumber::new(1);
        let sealed = client.seal(b"payload", pn, b"aad").unwrap();

        assert_eq!(server.open(&sealed, PacketNumber::new(2), b"aad"), Err(CryptoError::Decryption));
        assert_eq!(server.open(&sealed, pn, b"other"), Err(CryptoError::Decryption));
        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_eq!(server.open(&tampered, pn, b"aad"), Err(CryptoError::Decryption));
        // a client cannot open its own traffic
        assert!(client.open(&sealed, pn, b"aad").is_err());
    }

    #[test]
    fn test_header_masks_mirror() {
        let (client, server) = pair();
        let sample = [0x5a; SAMPLE_LEN];
        assert_eq!(
            client.seal_header_mask(&sample).unwrap(),
            server.open_header_mask(&sample).unwrap()
        );
        assert!(client.seal_header_mask(&sample[..4]).is_err());
    }

    #[test]
    fn test_aead_set_levels() {
        let (client, _) = pair();
        let mut set = AeadSet::new(client);
        assert!(set.is_available(EncryptionLevel::Initial));
        assert_eq!(
            set.get(EncryptionLevel::Handshake).unwrap_err(),
            ProtocolError::MissingAead(EncryptionLevel::Handshake)
        );
        let (hs, _) = pair();
        set.set_handshake(hs);
        assert!(set.is_available(EncryptionLevel::Handshake));
        assert!(!set.is_available(EncryptionLevel::OneRtt));
    }
}
