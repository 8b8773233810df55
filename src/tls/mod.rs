//! TLS 1.3 handshake for QUIC.
//!
//! A deliberately small TLS 1.3 implementation: one cipher suite
//! (TLS_AES_128_GCM_SHA256), X25519 key exchange and ECDSA P-256 server
//! signatures. Handshake bytes travel in CRYPTO frames; the sessions only
//! turn bytes into keys and bytes. The client does not validate the
//! server certificate chain.

pub mod extensions;
pub mod messages;
pub mod transport_parameters;

use bytes::{Bytes, BytesMut};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use tracing::{debug, trace};

use crate::crypto::aead::Aead;
use crate::crypto::hkdf::HASH_LEN;
use crate::crypto::key_schedule::{self, HandshakeSecrets};
use crate::quic::error::{CryptoError, Result, TlsError};

use extensions::{
    Extension, KeyShareEntry, ECDSA_SECP256R1_SHA256, GROUP_X25519, TLS13,
};
use messages::{
    Certificate, CertificateVerify, ClientHello, EncryptedExtensions, Finished,
    HandshakeMessage, ServerHello, TLS_AES_128_GCM_SHA256,
};
pub use transport_parameters::TransportParameters;

/// The endpoint that wrote a message or extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Running SHA-256 over every handshake message in order.
#[derive(Clone)]
pub struct Transcript(digest::Context);

impl Transcript {
    pub fn new() -> Self {
        Self(digest::Context::new(&digest::SHA256))
    }

    pub fn update(&mut self, message: &[u8]) {
        self.0.update(message);
    }

    pub fn hash(&self) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(self.0.clone().finish().as_ref());
        out
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transcript({})", hex::encode(self.hash()))
    }
}

/// Outcome of a completed client handshake.
#[derive(Debug)]
pub struct HandshakeResult {
    pub one_rtt_aead: Aead,
    /// Encoded client Finished, to be sent at the Handshake level.
    pub fin: Bytes,
    pub server_transport_parameters: Option<TransportParameters>,
    pub server_certificates: Vec<Bytes>,
}

/// Everything the server produces in response to a ClientHello.
#[derive(Debug)]
pub struct ServerHelloAndHandshake {
    /// Encoded ServerHello, sent at the Initial level.
    pub server_hello: Bytes,
    /// EncryptedExtensions, Certificate, CertificateVerify and Finished,
    /// sent at the Handshake level.
    pub server_handshake: Bytes,
    pub handshake_aead: Aead,
    pub one_rtt_aead: Aead,
    pub client_transport_parameters: Option<TransportParameters>,
}

fn find_key_share(extensions: &[Extension]) -> Result<Bytes> {
    extensions::find(extensions, |ext| match ext {
        Extension::KeyShare(entries) => entries
            .iter()
            .find(|entry| entry.group == GROUP_X25519)
            .map(|entry| entry.key.clone()),
        _ => None,
    })
    .ok_or_else(|| TlsError::MissingExtension("key_share").into())
}

fn find_transport_parameters(extensions: &[Extension]) -> Option<TransportParameters> {
    extensions::find(extensions, |ext| match ext {
        Extension::TransportParameters(params) => Some(params.clone()),
        _ => None,
    })
}

fn generate_key_share(rng: &SystemRandom) -> Result<(EphemeralPrivateKey, Bytes)> {
    let private_key =
        EphemeralPrivateKey::generate(&X25519, rng).map_err(|_| CryptoError::KeyExchange)?;
    let public_key = private_key
        .compute_public_key()
        .map_err(|_| CryptoError::KeyExchange)?;
    Ok((private_key, Bytes::copy_from_slice(public_key.as_ref())))
}

fn agree(
    private_key: EphemeralPrivateKey,
    peer_public_key: &[u8],
    hello_hash: &[u8],
) -> Result<HandshakeSecrets> {
    let peer = UnparsedPublicKey::new(&X25519, peer_public_key);
    let secrets = agreement::agree_ephemeral(private_key, &peer, |shared| {
        HandshakeSecrets::derive(shared, hello_hash)
    })
    .map_err(|_| CryptoError::KeyExchange)??;
    Ok(secrets)
}

/// Content covered by the server CertificateVerify signature.
fn certificate_verify_content(transcript_hash: &[u8]) -> Vec<u8> {
    let mut content = vec![0x20u8; 64];
    content.extend_from_slice(b"TLS 1.3, server CertificateVerify");
    content.push(0);
    content.extend_from_slice(transcript_hash);
    content
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerFlight {
    EncryptedExtensions,
    Certificate,
    CertificateVerify,
    Finished,
    Done,
}

/// Client side of the handshake.
pub struct ClientTlsSession {
    transport_parameters: TransportParameters,
    rng: SystemRandom,
    private_key: Option<EphemeralPrivateKey>,
    transcript: Transcript,
    secrets: Option<HandshakeSecrets>,
    pending: BytesMut,
    expecting: ServerFlight,
    server_transport_parameters: Option<TransportParameters>,
    server_certificates: Vec<Bytes>,
}

impl ClientTlsSession {
    pub fn new(transport_parameters: TransportParameters) -> Self {
        Self {
            transport_parameters,
            rng: SystemRandom::new(),
            private_key: None,
            transcript: Transcript::new(),
            secrets: None,
            pending: BytesMut::new(),
            expecting: ServerFlight::EncryptedExtensions,
            server_transport_parameters: None,
            server_certificates: Vec::new(),
        }
    }

    /// Produce a fresh ClientHello with a new ephemeral key.
    pub fn start_handshake(&mut self) -> Result<Bytes> {
        let (private_key, public_key) = generate_key_share(&self.rng)?;
        let hello = HandshakeMessage::ClientHello(ClientHello {
            random: rand::random(),
            session_id: Bytes::new(),
            cipher_suites: vec![TLS_AES_128_GCM_SHA256],
            extensions: vec![
                Extension::KeyShare(vec![KeyShareEntry {
                    group: GROUP_X25519,
                    key: public_key,
                }]),
                Extension::SupportedGroups(vec![GROUP_X25519]),
                Extension::SupportedVersions(vec![TLS13]),
                Extension::SignatureAlgorithms(vec![ECDSA_SECP256R1_SHA256]),
                Extension::TransportParameters(self.transport_parameters.clone()),
            ],
        })
        .encode()?;

        self.transcript.update(&hello);
        self.private_key = Some(private_key);
        trace!("ClientHello: {} bytes", hello.len());
        Ok(hello)
    }

    /// Consume the ServerHello and return the Handshake-level AEAD.
    pub fn handle_server_hello(&mut self, data: &[u8]) -> Result<Aead> {
        let mut buf = Bytes::copy_from_slice(data);
        let (message, raw) =
            HandshakeMessage::parse(&mut buf)?.ok_or(TlsError::Malformed("ServerHello"))?;
        let hello = match message {
            HandshakeMessage::ServerHello(hello) => hello,
            other => return Err(TlsError::UnexpectedMessage(other.handshake_type() as u8).into()),
        };
        if hello.cipher_suite != TLS_AES_128_GCM_SHA256 {
            return Err(TlsError::Unsupported.into());
        }
        let peer_key = find_key_share(&hello.extensions)?;
        let private_key = self
            .private_key
            .take()
            .ok_or(TlsError::OutOfOrder("ServerHello before ClientHello"))?;

        self.transcript.update(&raw);
        let secrets = agree(private_key, &peer_key, &self.transcript.hash())?;
        let aead = key_schedule::handshake_aead(&secrets, true)?;
        self.secrets = Some(secrets);
        debug!("Handshake keys derived from ServerHello");
        Ok(aead)
    }

    /// Consume server Handshake-level CRYPTO data.
    ///
    /// Data may arrive in pieces; `None` means more is needed. Once the
    /// server Finished verifies, the 1-RTT AEAD and the client Finished are
    /// returned.
    pub fn handle_handshake(&mut self, data: &[u8]) -> Result<Option<HandshakeResult>> {
        let secrets = self
            .secrets
            .clone()
            .ok_or(TlsError::OutOfOrder("handshake data before ServerHello"))?;
        self.pending.extend_from_slice(data);
        let mut buf = self.pending.split().freeze();

        while let Some((message, raw)) = HandshakeMessage::parse(&mut buf)? {
            match (self.expecting, message) {
                (ServerFlight::EncryptedExtensions, HandshakeMessage::EncryptedExtensions(ee)) => {
                    self.server_transport_parameters = find_transport_parameters(&ee.extensions);
                    self.expecting = ServerFlight::Certificate;
                }
                (ServerFlight::Certificate, HandshakeMessage::Certificate(cert)) => {
                    self.server_certificates = cert.certificates;
                    self.expecting = ServerFlight::CertificateVerify;
                }
                (ServerFlight::CertificateVerify, HandshakeMessage::CertificateVerify(cv)) => {
                    if cv.scheme != ECDSA_SECP256R1_SHA256 {
                        return Err(TlsError::Unsupported.into());
                    }
                    self.expecting = ServerFlight::Finished;
                }
                (ServerFlight::Finished, HandshakeMessage::Finished(fin)) => {
                    let expected_hash = self.transcript.hash();
                    if !key_schedule::verify_finished(
                        &fin.verify_data,
                        &secrets.server_traffic,
                        &expected_hash,
                    )? {
                        return Err(TlsError::BadFinished.into());
                    }
                    self.transcript.update(&raw);
                    let handshake_hash = self.transcript.hash();

                    let one_rtt_aead =
                        key_schedule::one_rtt_aead(&secrets.handshake_secret, &handshake_hash, true)?;
                    let verify_data =
                        key_schedule::verify_data(&secrets.client_traffic, &handshake_hash)?;
                    let fin = HandshakeMessage::Finished(Finished {
                        verify_data: Bytes::from(verify_data),
                    })
                    .encode()?;
                    self.transcript.update(&fin);
                    self.expecting = ServerFlight::Done;
                    debug!("Server Finished verified");

                    return Ok(Some(HandshakeResult {
                        one_rtt_aead,
                        fin,
                        server_transport_parameters: self.server_transport_parameters.clone(),
                        server_certificates: std::mem::take(&mut self.server_certificates),
                    }));
                }
                (_, other) => {
                    return Err(TlsError::UnexpectedMessage(other.handshake_type() as u8).into())
                }
            }
            self.transcript.update(&raw);
        }

        self.pending.extend_from_slice(&buf);
        Ok(None)
    }

    pub fn is_complete(&self) -> bool {
        self.expecting == ServerFlight::Done
    }

    /// Forget all handshake progress. Used after a Retry.
    pub fn reset(&mut self) {
        *self = Self::new(self.transport_parameters.clone());
    }
}

impl std::fmt::Debug for ClientTlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTlsSession")
            .field("transcript", &self.transcript)
            .field("has_secrets", &self.secrets.is_some())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Server side of the handshake.
pub struct ServerTlsSession {
    certificates: Vec<Bytes>,
    key_pair: EcdsaKeyPair,
    transport_parameters: TransportParameters,
    rng: SystemRandom,
    transcript: Transcript,
    secrets: Option<HandshakeSecrets>,
    /// Transcript hash through the server Finished.
    finished_hash: Option<[u8; HASH_LEN]>,
    pending: BytesMut,
    complete: bool,
}

impl ServerTlsSession {
    /// `private_key` is a PKCS#8 encoded ECDSA P-256 key matching the leaf
    /// certificate.
    pub fn new(
        certificates: Vec<Bytes>,
        private_key: &[u8],
        transport_parameters: TransportParameters,
    ) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, private_key, &rng)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(Self {
            certificates,
            key_pair,
            transport_parameters,
            rng,
            transcript: Transcript::new(),
            secrets: None,
            finished_hash: None,
            pending: BytesMut::new(),
            complete: false,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    pub fn handle_client_hello(&mut self, data: &[u8]) -> Result<ServerHelloAndHandshake> {
        if self.secrets.is_some() {
            return Err(TlsError::OutOfOrder("second ClientHello").into());
        }
        let mut buf = Bytes::copy_from_slice(data);
        let (message, raw) =
            HandshakeMessage::parse(&mut buf)?.ok_or(TlsError::Malformed("ClientHello"))?;
        let hello = match message {
            HandshakeMessage::ClientHello(hello) => hello,
            other => return Err(TlsError::UnexpectedMessage(other.handshake_type() as u8).into()),
        };
        if !hello.cipher_suites.contains(&TLS_AES_128_GCM_SHA256) {
            return Err(TlsError::Unsupported.into());
        }
        let peer_key = find_key_share(&hello.extensions)?;
        let client_transport_parameters = find_transport_parameters(&hello.extensions);
        self.transcript.update(&raw);

        let (private_key, public_key) = generate_key_share(&self.rng)?;
        let server_hello = HandshakeMessage::ServerHello(ServerHello {
            random: rand::random(),
            session_id: hello.session_id,
            cipher_suite: TLS_AES_128_GCM_SHA256,
            extensions: vec![
                Extension::KeyShare(vec![KeyShareEntry {
                    group: GROUP_X25519,
                    key: public_key,
                }]),
                Extension::SupportedVersions(vec![TLS13]),
            ],
        })
        .encode()?;
        self.transcript.update(&server_hello);

        let secrets = agree(private_key, &peer_key, &self.transcript.hash())?;
        let handshake_aead = key_schedule::handshake_aead(&secrets, false)?;

        let mut server_handshake = BytesMut::new();
        let encrypted_extensions = HandshakeMessage::EncryptedExtensions(EncryptedExtensions {
            extensions: vec![Extension::TransportParameters(
                self.transport_parameters.clone(),
            )],
        })
        .encode()?;
        self.append(&mut server_handshake, &encrypted_extensions);

        let certificate = HandshakeMessage::Certificate(Certificate {
            request_context: Bytes::new(),
            certificates: self.certificates.clone(),
        })
        .encode()?;
        self.append(&mut server_handshake, &certificate);

        let content = certificate_verify_content(&self.transcript.hash());
        let signature = self
            .key_pair
            .sign(&self.rng, &content)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        let certificate_verify = HandshakeMessage::CertificateVerify(CertificateVerify {
            scheme: ECDSA_SECP256R1_SHA256,
            signature: Bytes::copy_from_slice(signature.as_ref()),
        })
        .encode()?;
        self.append(&mut server_handshake, &certificate_verify);

        let verify_data = key_schedule::verify_data(&secrets.server_traffic, &self.transcript.hash())?;
        let finished = HandshakeMessage::Finished(Finished {
            verify_data: Bytes::from(verify_data),
        })
        .encode()?;
        self.append(&mut server_handshake, &finished);

        let finished_hash = self.transcript.hash();
        let one_rtt_aead = key_schedule::one_rtt_aead(&secrets.handshake_secret, &finished_hash, false)?;
        self.finished_hash = Some(finished_hash);
        self.secrets = Some(secrets);
        debug!("ServerHello and server handshake flight built");

        Ok(ServerHelloAndHandshake {
            server_hello,
            server_handshake: server_handshake.freeze(),
            handshake_aead,
            one_rtt_aead,
            client_transport_parameters,
        })
    }

    /// Verify the client Finished. Returns `false` while the message is
    /// still incomplete.
    pub fn handle_client_finished(&mut self, data: &[u8]) -> Result<bool> {
        let (secrets, finished_hash) = match (&self.secrets, self.finished_hash) {
            (Some(secrets), Some(hash)) => (secrets.clone(), hash),
            _ => return Err(TlsError::OutOfOrder("Finished before ClientHello").into()),
        };
        self.pending.extend_from_slice(data);
        let mut buf = self.pending.split().freeze();
        let Some((message, raw)) = HandshakeMessage::parse(&mut buf)? else {
            self.pending.extend_from_slice(&buf);
            return Ok(false);
        };
        let fin = match message {
            HandshakeMessage::Finished(fin) => fin,
            other => return Err(TlsError::UnexpectedMessage(other.handshake_type() as u8).into()),
        };
        if !key_schedule::verify_finished(&fin.verify_data, &secrets.client_traffic, &finished_hash)? {
            return Err(TlsError::BadFinished.into());
        }
        self.transcript.update(&raw);
        self.complete = true;
        debug!("Client Finished verified");
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn append(&mut self, flight: &mut BytesMut, message: &[u8]) {
        self.transcript.update(message);
        flight.extend_from_slice(message);
    }
}

impl std::fmt::Debug for ServerTlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsSession")
            .field("certificates", &self.certificates.len())
            .field("transcript", &self.transcript)
            .field("complete", &self.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionLevel;
    use crate::quic::connection_id::ConnectionId;
    use crate::quic::error::QuicError;
    use crate::quic::frame::Frame;
    use crate::quic::packet::{HandshakePacket, Packet, PacketNumber, Payload};
    use crate::quic::version::Version;
    use ring::signature::{UnparsedPublicKey as SignaturePublicKey, ECDSA_P256_SHA256_ASN1};
    use std::sync::Arc;

    pub(crate) fn test_server_session() -> ServerTlsSession {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        ServerTlsSession::new(
            vec![Bytes::from_static(b"test certificate")],
            pkcs8.as_ref(),
            TransportParameters {
                version: Version::CURRENT,
                supported_versions: vec![Version::CURRENT],
                idle_timeout: Some(30),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn client_session() -> ClientTlsSession {
        ClientTlsSession::new(TransportParameters {
            version: Version::CURRENT,
            initial_max_streams_bidi: Some(100),
            ..Default::default()
        })
    }

    #[test]
    fn test_full_handshake() {
        let mut client = client_session();
        let mut server = test_server_session();

        let client_hello = client.start_handshake().unwrap();
        let flight = server.handle_client_hello(&client_hello).unwrap();
        assert_eq!(
            flight.client_transport_parameters.unwrap().initial_max_streams_bidi,
            Some(100)
        );

        let client_hs = client.handle_server_hello(&flight.server_hello).unwrap();
        assert!(client_hs.seal_keys() == flight.handshake_aead.open_keys());
        assert!(client_hs.open_keys() == flight.handshake_aead.seal_keys());

        let result = client
            .handle_handshake(&flight.server_handshake)
            .unwrap()
            .expect("handshake should complete");
        assert!(client.is_complete());
        assert_eq!(result.server_transport_parameters.unwrap().idle_timeout, Some(30));
        assert_eq!(result.server_certificates.len(), 1);
        assert!(result.one_rtt_aead.seal_keys() == flight.one_rtt_aead.open_keys());

        assert!(server.handle_client_finished(&result.fin).unwrap());
        assert!(server.is_complete());
    }

    #[test]
    fn test_fragmented_server_flight() {
        let mut client = client_session();
        let mut server = test_server_session();
        let flight = server
            .handle_client_hello(&client.start_handshake().unwrap())
            .unwrap();
        client.handle_server_hello(&flight.server_hello).unwrap();

        let data = &flight.server_handshake;
        let (first, rest) = data.split_at(data.len() / 2);
        assert!(client.handle_handshake(first).unwrap().is_none());
        assert!(client.handle_handshake(rest).unwrap().is_some());
    }

    #[test]
    fn test_certificate_verify_signature() {
        let mut client = client_session();
        let mut server = test_server_session();
        let client_hello = client.start_handshake().unwrap();
        let flight = server.handle_client_hello(&client_hello).unwrap();

        let mut transcript = Transcript::new();
        transcript.update(&client_hello);
        transcript.update(&flight.server_hello);
        let mut buf = flight.server_handshake.clone();
        let mut signature = None;
        while let Some((message, raw)) = HandshakeMessage::parse(&mut buf).unwrap() {
            if let HandshakeMessage::CertificateVerify(cv) = message {
                signature = Some(cv.signature);
                break;
            }
            transcript.update(&raw);
        }
        let content = certificate_verify_content(&transcript.hash());
        let key = SignaturePublicKey::new(&ECDSA_P256_SHA256_ASN1, server.public_key());
        key.verify(&content, &signature.unwrap()).unwrap();
    }

    #[test]
    fn test_tampered_server_finished_is_rejected() {
        let mut client = client_session();
        let mut server = test_server_session();
        let flight = server
            .handle_client_hello(&client.start_handshake().unwrap())
            .unwrap();
        client.handle_server_hello(&flight.server_hello).unwrap();

        let mut tampered = flight.server_handshake.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(matches!(
            client.handle_handshake(&tampered),
            Err(QuicError::Tls(TlsError::BadFinished))
        ));
    }

    #[test]
    fn test_out_of_order_and_reset() {
        let mut client = client_session();
        assert!(client.handle_handshake(&[0x14, 0, 0, 0]).is_err());
        let first = client.start_handshake().unwrap();
        client.reset();
        let second = client.start_handshake().unwrap();
        assert_ne!(first, second);
        assert!(!client.is_complete());
    }

    #[test]
    fn test_handshake_keys_protect_packets() {
        let mut client = client_session();
        let mut server = test_server_session();
        let flight = server
            .handle_client_hello(&client.start_handshake().unwrap())
            .unwrap();
        let client_hs = Arc::new(client.handle_server_hello(&flight.server_hello).unwrap());
        let server_hs = Arc::new(flight.handshake_aead);

        let dcid = ConnectionId::random();
        let packet = Packet::Handshake(HandshakePacket {
            version: Version::CURRENT,
            dest_connection_id: dcid.clone(),
            src_connection_id: ConnectionId::random(),
            packet_number: PacketNumber::new(0),
            payload: Payload::single(Frame::crypto(0, flight.server_handshake.clone())),
        });
        let wire = packet.write(&server_hs).unwrap();
        let parsed = Packet::parse_header(wire, dcid.len())
            .unwrap()
            .complete(|level| {
                assert_eq!(level, EncryptionLevel::Handshake);
                Ok(client_hs.clone())
            })
            .unwrap();
        assert_eq!(parsed, packet);
    }
}
