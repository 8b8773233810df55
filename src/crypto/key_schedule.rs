//! Derivation of per-level packet protection keys.
//!
//! Initial keys come straight from the client's first destination
//! connection ID. Handshake and 1-RTT keys follow the TLS 1.3 key schedule
//! over the handshake transcript.

use ring::hmac;

use super::aead::{Aead, DirectionalKeys};
use super::hkdf::{self, HASH_LEN};
use crate::quic::connection_id::ConnectionId;
use crate::quic::error::CryptoError;

/// Initial salt for the draft-17 family of versions
pub const INITIAL_SALT: [u8; 20] = [
    0xef, 0x4f, 0xb0, 0xab, 0xb4, 0x74, 0x70, 0xc4, 0x1b, 0xef, 0xcf, 0x80, 0x31, 0x33, 0x4f, 0xae,
    0x48, 0x5e, 0x09, 0xa0,
];

pub mod labels {
    pub const CLIENT_INITIAL: &[u8] = b"client in";
    pub const SERVER_INITIAL: &[u8] = b"server in";
    pub const DERIVED: &[u8] = b"derived";
    pub const CLIENT_HANDSHAKE_TRAFFIC: &[u8] = b"c hs traffic";
    pub const SERVER_HANDSHAKE_TRAFFIC: &[u8] = b"s hs traffic";
    pub const CLIENT_APPLICATION_TRAFFIC: &[u8] = b"c ap traffic";
    pub const SERVER_APPLICATION_TRAFFIC: &[u8] = b"s ap traffic";
    pub const KEY: &[u8] = b"quic key";
    pub const IV: &[u8] = b"quic iv";
    pub const HP_KEY: &[u8] = b"quic hp";
    pub const FINISHED: &[u8] = b"finished";
}

pub type Secret = [u8; HASH_LEN];

/// Expand a traffic secret into key, IV and header protection key.
pub fn packet_keys(secret: &[u8]) -> Result<DirectionalKeys, CryptoError> {
    Ok(DirectionalKeys {
        key: hkdf::expand_label_array(secret, labels::KEY, &[])?,
        iv: hkdf::expand_label_array(secret, labels::IV, &[])?,
        hp: hkdf::expand_label_array(secret, labels::HP_KEY, &[])?,
    })
}

/// Build the AEAD for one side from the client and server traffic secrets.
fn role_aead(client_secret: &[u8], server_secret: &[u8], is_client: bool) -> Result<Aead, CryptoError> {
    let client = packet_keys(client_secret)?;
    let server = packet_keys(server_secret)?;
    if is_client {
        Aead::new(client, server)
    } else {
        Aead::new(server, client)
    }
}

/// Initial keys, keyed off the destination connection ID of the client's
/// first Initial packet.
pub fn initial_aead(connection_id: &ConnectionId, is_client: bool) -> Result<Aead, CryptoError> {
    let initial_secret = hkdf::extract(&INITIAL_SALT, connection_id.as_bytes());
    let client = hkdf::expand_label(&initial_secret, labels::CLIENT_INITIAL, &[], HASH_LEN)?;
    let server = hkdf::expand_label(&initial_secret, labels::SERVER_INITIAL, &[], HASH_LEN)?;
    role_aead(&client, &server, is_client)
}

/// Secrets produced once ClientHello and ServerHello are both known.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeSecrets {
    pub handshake_secret: Secret,
    pub client_traffic: Secret,
    pub server_traffic: Secret,
}

impl std::fmt::Debug for HandshakeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HandshakeSecrets(..)")
    }
}

impl HandshakeSecrets {
    /// `hello_hash` is the transcript hash of ClientHello || ServerHello.
    pub fn derive(shared_secret: &[u8], hello_hash: &[u8]) -> Result<Self, CryptoError> {
        let early_secret = hkdf::extract(&[0u8; HASH_LEN], &[0u8; HASH_LEN]);
        let derived: Secret =
            hkdf::expand_label_array(&early_secret, labels::DERIVED, &hkdf::empty_hash())?;
        let handshake_secret = hkdf::extract(&derived, shared_secret);

        Ok(Self {
            handshake_secret,
            client_traffic: hkdf::expand_label_array(
                &handshake_secret,
                labels::CLIENT_HANDSHAKE_TRAFFIC,
                hello_hash,
            )?,
            server_traffic: hkdf::expand_label_array(
                &handshake_secret,
                labels::SERVER_HANDSHAKE_TRAFFIC,
                hello_hash,
            )?,
        })
    }
}

pub fn handshake_aead(secrets: &HandshakeSecrets, is_client: bool) -> Result<Aead, CryptoError> {
    role_aead(&secrets.client_traffic, &secrets.server_traffic, is_client)
}

/// 1-RTT keys. `handshake_hash` covers the transcript through the server
/// Finished message.
pub fn one_rtt_aead(
    handshake_secret: &[u8],
    handshake_hash: &[u8],
    is_client: bool,
) -> Result<Aead, CryptoError> {
    let derived: Secret =
        hkdf::expand_label_array(handshake_secret, labels::DERIVED, &hkdf::empty_hash())?;
    let master_secret = hkdf::extract(&derived, &[0u8; HASH_LEN]);

    let client = hkdf::expand_label(
        &master_secret,
        labels::CLIENT_APPLICATION_TRAFFIC,
        handshake_hash,
        HASH_LEN,
    )?;
    let server = hkdf::expand_label(
        &master_secret,
        labels::SERVER_APPLICATION_TRAFFIC,
        handshake_hash,
        HASH_LEN,
    )?;
    role_aead(&client, &server, is_client)
}

fn finished_key(traffic_secret: &[u8]) -> Result<hmac::Key, CryptoError> {
    let key = hkdf::expand_label(traffic_secret, labels::FINISHED, &[], HASH_LEN)?;
    Ok(hmac::Key::new(hmac::HMAC_SHA256, &key))
}

/// Finished verify_data for the given traffic secret and transcript hash.
pub fn verify_data(traffic_secret: &[u8], finished_hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = finished_key(traffic_secret)?;
    Ok(hmac::sign(&key, finished_hash).as_ref().to_vec())
}

/// Constant-time check of received verify_data.
pub fn verify_finished(
    received: &[u8],
    traffic_secret: &[u8],
    finished_hash: &[u8],
) -> Result<bool, CryptoError> {
    let key = finished_key(traffic_secret)?;
    Ok(hmac::verify(&key, finished_hash, received).is_ok())
}
