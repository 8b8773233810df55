//! TLS 1.3 handshake messages and their framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::extensions::{read_exact, Extension};
use super::Role;
use crate::quic::error::TlsError;

pub const LEGACY_VERSION: u16 = 0x0303;
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const RANDOM_LEN: usize = 32;

/// Handshake header: 1 byte type, 24-bit length.
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
    EncryptedExtensions = 8,
    Certificate = 11,
    CertificateVerify = 15,
    Finished = 20,
}

impl HandshakeType {
    fn from_byte(byte: u8) -> Result<Self, TlsError> {
        Ok(match byte {
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            8 => HandshakeType::EncryptedExtensions,
            11 => HandshakeType::Certificate,
            15 => HandshakeType::CertificateVerify,
            20 => HandshakeType::Finished,
            other => return Err(TlsError::UnexpectedMessage(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Bytes,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Bytes,
    pub cipher_suite: u16,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub request_context: Bytes,
    /// DER certificates, leaf first.
    pub certificates: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub scheme: u16,
    pub signature: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    EncryptedExtensions(EncryptedExtensions),
    Certificate(Certificate),
    CertificateVerify(CertificateVerify),
    Finished(Finished),
}

impl HandshakeMessage {
    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            HandshakeMessage::ClientHello(_) => HandshakeType::ClientHello,
            HandshakeMessage::ServerHello(_) => HandshakeType::ServerHello,
            HandshakeMessage::EncryptedExtensions(_) => HandshakeType::EncryptedExtensions,
            HandshakeMessage::Certificate(_) => HandshakeType::Certificate,
            HandshakeMessage::CertificateVerify(_) => HandshakeType::CertificateVerify,
            HandshakeMessage::Finished(_) => HandshakeType::Finished,
        }
    }

    /// Encode the message including its handshake header.
    pub fn encode(&self) -> Result<Bytes, TlsError> {
        let mut body = BytesMut::new();
        match self {
            HandshakeMessage::ClientHello(hello) => {
                body.put_u16(LEGACY_VERSION);
                body.put_slice(&hello.random);
                body.put_u8(hello.session_id.len() as u8);
                body.put_slice(&hello.session_id);
                body.put_u16((hello.cipher_suites.len() * 2) as u16);
                hello.cipher_suites.iter().for_each(|s| body.put_u16(*s));
                // legacy compression methods: null only
                body.put_u8(1);
                body.put_u8(0);
                Extension::write_all(&hello.extensions, &mut body, Role::Client)?;
            }
            HandshakeMessage::ServerHello(hello) => {
                body.put_u16(LEGACY_VERSION);
                body.put_slice(&hello.random);
                body.put_u8(hello.session_id.len() as u8);
                body.put_slice(&hello.session_id);
                body.put_u16(hello.cipher_suite);
                body.put_u8(0);
                Extension::write_all(&hello.extensions, &mut body, Role::Server)?;
            }
            HandshakeMessage::EncryptedExtensions(ee) => {
                Extension::write_all(&ee.extensions, &mut body, Role::Server)?;
            }
            HandshakeMessage::Certificate(cert) => {
                body.put_u8(cert.request_context.len() as u8);
                body.put_slice(&cert.request_context);
                let mut list = BytesMut::new();
                for der in &cert.certificates {
                    put_u24(&mut list, der.len());
                    list.put_slice(der);
                    list.put_u16(0);
                }
                put_u24(&mut body, list.len());
                body.put_slice(&list);
            }
            HandshakeMessage::CertificateVerify(cv) => {
                body.put_u16(cv.scheme);
                body.put_u16(cv.signature.len() as u16);
                body.put_slice(&cv.signature);
            }
            HandshakeMessage::Finished(fin) => body.put_slice(&fin.verify_data),
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u8(self.handshake_type() as u8);
        put_u24(&mut out, body.len());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Parse one complete message from the front of `buf`.
    ///
    /// Returns `None` without consuming anything when `buf` holds only part
    /// of a message. On success the raw encoded bytes are returned alongside
    /// the message for the transcript.
    pub fn parse(buf: &mut Bytes) -> Result<Option<(Self, Bytes)>, TlsError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = (usize::from(buf[1]) << 16) | (usize::from(buf[2]) << 8) | usize::from(buf[3]);
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let raw = buf.split_to(HEADER_LEN + len);
        let handshake_type = HandshakeType::from_byte(raw[0])?;
        let mut body = raw.slice(HEADER_LEN..);

        let message = match handshake_type {
            HandshakeType::ClientHello => {
                let what = "ClientHello";
                expect_u16(&mut body, LEGACY_VERSION, what)?;
                let random = read_random(&mut body, what)?;
                let session_id = read_vec8(&mut body, what)?;
                let mut suites = read_vec16(&mut body, what)?;
                if suites.len() % 2 != 0 {
                    return Err(TlsError::Malformed(what));
                }
                let mut cipher_suites = Vec::new();
                while suites.has_remaining() {
                    cipher_suites.push(suites.get_u16());
                }
                read_vec8(&mut body, what)?;
                let extensions = Extension::parse_all(&mut body, Role::Client)?;
                HandshakeMessage::ClientHello(ClientHello {
                    random,
                    session_id,
                    cipher_suites,
                    extensions,
                })
            }
            HandshakeType::ServerHello => {
                let what = "ServerHello";
                expect_u16(&mut body, LEGACY_VERSION, what)?;
                let random = read_random(&mut body, what)?;
                let session_id = read_vec8(&mut body, what)?;
                if body.remaining() < 3 {
                    return Err(TlsError::Malformed(what));
                }
                let cipher_suite = body.get_u16();
                body.advance(1);
                let extensions = Extension::parse_all(&mut body, Role::Server)?;
                HandshakeMessage::ServerHello(ServerHello {
                    random,
                    session_id,
                    cipher_suite,
                    extensions,
                })
            }
            HandshakeType::EncryptedExtensions => {
                HandshakeMessage::EncryptedExtensions(EncryptedExtensions {
                    extensions: Extension::parse_all(&mut body, Role::Server)?,
                })
            }
            HandshakeType::Certificate => {
                let what = "Certificate";
                let request_context = read_vec8(&mut body, what)?;
                let list_len = read_u24(&mut body, what)?;
                let mut list = read_exact(&mut body, list_len, what)
                    .map_err(|_| TlsError::Malformed(what))?;
                let mut certificates = Vec::new();
                while list.has_remaining() {
                    let len = read_u24(&mut list, what)?;
                    certificates.push(
                        read_exact(&mut list, len, what).map_err(|_| TlsError::Malformed(what))?,
                    );
                    read_vec16(&mut list, what)?;
                }
                HandshakeMessage::Certificate(Certificate {
                    request_context,
                    certificates,
                })
            }
            HandshakeType::CertificateVerify => {
                let what = "CertificateVerify";
                if body.remaining() < 2 {
                    return Err(TlsError::Malformed(what));
                }
                let scheme = body.get_u16();
                let signature = read_vec16(&mut body, what)?;
                HandshakeMessage::CertificateVerify(CertificateVerify { scheme, signature })
            }
            HandshakeType::Finished => HandshakeMessage::Finished(Finished {
                verify_data: std::mem::take(&mut body),
            }),
        };

        if body.has_remaining() {
            return Err(TlsError::Malformed("handshake message trailer"));
        }
        Ok(Some((message, raw)))
    }
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

fn read_u24(buf: &mut Bytes, what: &'static str) -> Result<usize, TlsError> {
    if buf.remaining() < 3 {
        return Err(TlsError::Malformed(what));
    }
    let high = usize::from(buf.get_u8());
    Ok((high << 16) | usize::from(buf.get_u16()))
}

fn expect_u16(buf: &mut Bytes, expected: u16, what: &'static str) -> Result<(), TlsError> {
    if buf.remaining() < 2 || buf.get_u16() != expected {
        return Err(TlsError::Malformed(what));
    }
    Ok(())
}

fn read_random(buf: &mut Bytes, what: &'static str) -> Result<[u8; RANDOM_LEN], TlsError> {
    if buf.remaining() < RANDOM_LEN {
        return Err(TlsError::Malformed(what));
    }
    let mut random = [0u8; RANDOM_LEN];
    buf.copy_to_slice(&mut random);
    Ok(random)
}

fn read_vec8(buf: &mut Bytes, what: &'static str) -> Result<Bytes, TlsError> {
    if !buf.has_remaining() {
        return Err(TlsError::Malformed(what));
    }
    let len = usize::from(buf.get_u8());
    read_exact(buf, len, what).map_err(|_| TlsError::Malformed(what))
}

fn read_vec16(buf: &mut Bytes, what: &'static str) -> Result<Bytes, TlsError> {
    if buf.remaining() < 2 {
        return Err(TlsError::Malformed(what));
    }
    let len = usize::from(buf.get_u16());
    read_exact(buf, len, what).map_err(|_| TlsError::Malformed(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::extensions::{KeyShareEntry, GROUP_X25519, TLS13};

    fn client_hello() -> HandshakeMessage {
        HandshakeMessage::ClientHello(ClientHello {
            random: [3u8; RANDOM_LEN],
            session_id: Bytes::new(),
            cipher_suites: vec![TLS_AES_128_GCM_SHA256],
            extensions: vec![
                Extension::KeyShare(vec![KeyShareEntry {
                    group: GROUP_X25519,
                    key: Bytes::from(vec![1u8; 32]),
                }]),
                Extension::SupportedVersions(vec![TLS13]),
            ],
        })
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let message = client_hello();
        let encoded = message.encode().unwrap();
        assert_eq!(encoded[0], HandshakeType::ClientHello as u8);

        let mut buf = encoded.clone();
        let (parsed, raw) = HandshakeMessage::parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, message);
        assert_eq!(raw, encoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_is_not_consumed() {
        let encoded = client_hello().encode().unwrap();
        let mut buf = encoded.slice(..encoded.len() - 1);
        assert!(HandshakeMessage::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_server_flight_parses_in_sequence() {
        let flight = [
            HandshakeMessage::EncryptedExtensions(EncryptedExtensions { extensions: vec![] }),
            HandshakeMessage::Certificate(Certificate {
                request_context: Bytes::new(),
                certificates: vec![Bytes::from_static(b"leaf"), Bytes::from_static(b"root")],
            }),
            HandshakeMessage::CertificateVerify(CertificateVerify {
                scheme: 0x0403,
                signature: Bytes::from_static(&[5u8; 70]),
            }),
            HandshakeMessage::Finished(Finished {
                verify_data: Bytes::from_static(&[6u8; 32]),
            }),
        ];
        let mut buf = BytesMut::new();
        for message in &flight {
            buf.put_slice(&message.encode().unwrap());
        }
        let mut buf = buf.freeze();
        for expected in &flight {
            let (parsed, _) = HandshakeMessage::parse(&mut buf).unwrap().unwrap();
            assert_eq!(&parsed, expected);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = Bytes::from_static(&[0x63, 0x00, 0x00, 0x00]);
        assert_eq!(
            HandshakeMessage::parse(&mut buf),
            Err(TlsError::UnexpectedMessage(0x63))
        );
    }
}
