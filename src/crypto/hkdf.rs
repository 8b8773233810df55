//! HKDF-SHA256 primitives with the TLS 1.3 `HkdfLabel` encoding.

use ring::{digest, hkdf, hmac};

use crate::quic::error::CryptoError;

/// Output length of SHA-256 and of every traffic secret
pub const HASH_LEN: usize = 32;

/// SHA-256 of the empty string, used as context for `derived`
pub fn empty_hash() -> [u8; HASH_LEN] {
    sha256(&[])
}

pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    out
}

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Extract. Computed as HMAC(salt, ikm) so the pseudo-random key is
/// available as bytes for later Expand-Label calls.
pub fn extract(salt: &[u8], ikm: &[u8]) -> [u8; HASH_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, salt);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(hmac::sign(&key, ikm).as_ref());
    out
}

/// HKDF-Expand-Label(secret, label, context, len) with the "tls13 " prefix.
pub fn expand_label(
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Result<Vec<u8>, CryptoError> {
    const PREFIX: &[u8] = b"tls13 ";

    let length = (len as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let context_len = [context.len() as u8];
    let info: [&[u8]; 6] = [&length, &label_len, PREFIX, label, &context_len, context];

    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    let okm = prk
        .expand(&info, OutputLen(len))
        .map_err(|_| CryptoError::KeyDerivation(String::from_utf8_lossy(label).into_owned()))?;
    let mut out = vec![0u8; len];
    okm.fill(&mut out)
        .map_err(|_| CryptoError::KeyDerivation(String::from_utf8_lossy(label).into_owned()))?;
    Ok(out)
}

/// Expand-Label into a fixed-size array.
pub fn expand_label_array<const N: usize>(
    secret: &[u8],
    label: &[u8],
    context: &[u8],
) -> Result<[u8; N], CryptoError> {
    let out = expand_label(secret, label, context, N)?;
    let mut array = [0u8; N];
    array.copy_from_slice(&out);
    Ok(array)
}
