//! QUIC packet implementation
//!
//! Long header packets (Initial, Handshake, Retry, Version Negotiation) and
//! the short header packet used once 1-RTT keys are in place. Parsing is
//! split in two: [`Packet::parse_header`] reads everything that is sent in
//! the clear, and [`HalfParsedPacket::complete`] removes header protection
//! and decrypts the payload once the caller has picked the AEAD.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

use super::connection_id::ConnectionId;
use super::error::{PacketError, ProtocolError, Result};
use super::frame::Frame;
use super::varint;
use super::version::Version;
use crate::crypto::aead::{Aead, SAMPLE_LEN, TAG_LEN};
use crate::crypto::EncryptionLevel;

/// Minimum size of a datagram carrying a client Initial packet
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

const LONG_HEADER: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;
const PN_LEN_MASK: u8 = 0x03;
/// Packet numbers are always sent in four bytes
const PN_LEN: usize = 4;
/// Length field is always a two-byte varint
const LENGTH_FIELD_LEN: usize = 2;

/// Long header packet types, from the two type bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial = 0x00,
    ZeroRtt = 0x01,
    Handshake = 0x02,
    Retry = 0x03,
}

impl PacketType {
    pub fn from_first_byte(byte: u8) -> Self {
        match (byte & 0x30) >> 4 {
            0x00 => PacketType::Initial,
            0x01 => PacketType::ZeroRtt,
            0x02 => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }

    fn first_byte(self) -> u8 {
        LONG_HEADER | FIXED_BIT | ((self as u8) << 4)
    }
}

/// Packet number within one packet number space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PacketNumber(u64);

impl PacketNumber {
    pub const MIN: PacketNumber = PacketNumber(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    fn write<B: BufMut>(self, buf: &mut B) -> Result<()> {
        let value = u32::try_from(self.0).map_err(|_| PacketError::PacketNumberTooLarge(self.0))?;
        buf.put_u32(value);
        Ok(())
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-empty, ordered frame sequence carried by a protected packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    frames: Vec<Frame>,
}

impl Payload {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        if frames.is_empty() {
            return Err(PacketError::EmptyPayload.into());
        }
        Ok(Self { frames })
    }

    pub fn single(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// True when nothing in the payload needs acknowledging.
    pub fn is_ack_only(&self) -> bool {
        !self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// Length once sealed, including the AEAD tag.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(self.plaintext()?.len() + TAG_LEN)
    }

    fn plaintext(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        for frame in &self.frames {
            frame.write(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn parse(plaintext: &[u8]) -> Result<Self> {
        let mut buf = plaintext;
        Self::new(Frame::decode_all(&mut buf)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPacket {
    pub version: Version,
    pub dest_connection_id: ConnectionId,
    pub src_connection_id: ConnectionId,
    /// Empty when no retry token is held
    pub token: Bytes,
    pub packet_number: PacketNumber,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub version: Version,
    pub dest_connection_id: ConnectionId,
    pub src_connection_id: ConnectionId,
    pub packet_number: PacketNumber,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPacket {
    pub version: Version,
    pub dest_connection_id: ConnectionId,
    pub src_connection_id: ConnectionId,
    pub original_connection_id: ConnectionId,
    pub token: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub dest_connection_id: ConnectionId,
    pub src_connection_id: ConnectionId,
    pub supported_versions: Vec<Version>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortPacket {
    pub key_phase: bool,
    pub dest_connection_id: ConnectionId,
    pub packet_number: PacketNumber,
    pub payload: Payload,
}

/// QUIC packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Initial(InitialPacket),
    Handshake(HandshakePacket),
    Retry(RetryPacket),
    VersionNegotiation(VersionNegotiationPacket),
    Short(ShortPacket),
}

impl Packet {
    /// Level whose keys protect this packet. Retry and Version Negotiation
    /// packets are unprotected and report Initial.
    pub fn encryption_level(&self) -> EncryptionLevel {
        match self {
            Packet::Handshake(_) => EncryptionLevel::Handshake,
            Packet::Short(_) => EncryptionLevel::OneRtt,
            _ => EncryptionLevel::Initial,
        }
    }

    /// Full packets carry a packet number and an encrypted payload.
    pub fn is_full(&self) -> bool {
        self.packet_number().is_some()
    }

    pub fn packet_number(&self) -> Option<PacketNumber> {
        match self {
            Packet::Initial(p) => Some(p.packet_number),
            Packet::Handshake(p) => Some(p.packet_number),
            Packet::Short(p) => Some(p.packet_number),
            Packet::Retry(_) | Packet::VersionNegotiation(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Packet::Initial(p) => Some(&p.payload),
            Packet::Handshake(p) => Some(&p.payload),
            Packet::Short(p) => Some(&p.payload),
            Packet::Retry(_) | Packet::VersionNegotiation(_) => None,
        }
    }

    pub fn dest_connection_id(&self) -> &ConnectionId {
        match self {
            Packet::Initial(p) => &p.dest_connection_id,
            Packet::Handshake(p) => &p.dest_connection_id,
            Packet::Retry(p) => &p.dest_connection_id,
            Packet::VersionNegotiation(p) => &p.dest_connection_id,
            Packet::Short(p) => &p.dest_connection_id,
        }
    }

    pub fn src_connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Packet::Initial(p) => Some(&p.src_connection_id),
            Packet::Handshake(p) => Some(&p.src_connection_id),
            Packet::Retry(p) => Some(&p.src_connection_id),
            Packet::VersionNegotiation(p) => Some(&p.src_connection_id),
            Packet::Short(_) => None,
        }
    }

    /// Read the unprotected part of a packet. `short_cid_len` is the length
    /// of locally issued connection IDs; short headers do not carry it.
    pub fn parse_header(data: Bytes, short_cid_len: usize) -> Result<HalfParsedPacket> {
        if data.is_empty() {
            return Err(PacketError::TooSmall { size: 0 }.into());
        }
        let first = data[0];
        if first & LONG_HEADER == 0 {
            return parse_short_header(data, short_cid_len);
        }

        let mut buf = data.slice(1..);
        let version = Version::read(&mut buf)?;
        if version.is_negotiation() {
            return Ok(HalfParsedPacket::complete_packet(
                Packet::VersionNegotiation(parse_version_negotiation(buf)?),
            ));
        }

        let dest = ConnectionId::read_with_len(&mut buf)?;
        let src = ConnectionId::read_with_len(&mut buf)?;

        match PacketType::from_first_byte(first) {
            PacketType::Retry => {
                let original = ConnectionId::read_with_len(&mut buf)?;
                Ok(HalfParsedPacket::complete_packet(Packet::Retry(RetryPacket {
                    version,
                    dest_connection_id: dest,
                    src_connection_id: src,
                    original_connection_id: original,
                    token: buf,
                })))
            }
            packet_type @ (PacketType::Initial | PacketType::Handshake) => {
                let token = if packet_type == PacketType::Initial {
                    let len = varint::read(&mut buf)? as usize;
                    if buf.remaining() < len {
                        return Err(PacketError::IncompleteData.into());
                    }
                    buf.copy_to_bytes(len)
                } else {
                    Bytes::new()
                };
                let length = varint::read(&mut buf)? as usize;
                if buf.remaining() < length {
                    return Err(PacketError::IncompleteData.into());
                }
                let pn_offset = data.len() - buf.remaining();
                let level = if packet_type == PacketType::Initial {
                    EncryptionLevel::Initial
                } else {
                    EncryptionLevel::Handshake
                };
                Ok(HalfParsedPacket {
                    inner: HalfParsed::Protected(ProtectedHeader {
                        level,
                        version: Some(version),
                        dest,
                        src: Some(src),
                        token,
                        pn_offset,
                        // bytes past `length` belong to the datagram, not this packet
                        data: data.slice(..pn_offset + length),
                    }),
                })
            }
            PacketType::ZeroRtt => Err(PacketError::UnsupportedType(PacketType::ZeroRtt as u8).into()),
        }
    }

    /// Serialize, applying packet and header protection with `aead`.
    pub fn write(&self, aead: &Aead) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Packet::Initial(p) => {
                let mut header = BytesMut::new();
                header.put_u8(PacketType::Initial.first_byte() | (PN_LEN as u8 - 1));
                p.version.write(&mut header);
                p.dest_connection_id.write_with_len(&mut header);
                p.src_connection_id.write_with_len(&mut header);
                varint::write(&mut header, p.token.len() as u64)?;
                header.put_slice(&p.token);

                let mut plaintext = p.payload.plaintext()?;
                let unpadded = header.len() + LENGTH_FIELD_LEN + PN_LEN + plaintext.len() + TAG_LEN;
                if unpadded < MIN_INITIAL_PACKET_SIZE {
                    Frame::Padding {
                        length: MIN_INITIAL_PACKET_SIZE - unpadded,
                    }
                    .write(&mut plaintext)?;
                }
                write_protected(&mut buf, header, true, p.packet_number, &plaintext, aead)?;
            }
            Packet::Handshake(p) => {
                let mut header = BytesMut::new();
                header.put_u8(PacketType::Handshake.first_byte() | (PN_LEN as u8 - 1));
                p.version.write(&mut header);
                p.dest_connection_id.write_with_len(&mut header);
                p.src_connection_id.write_with_len(&mut header);
                let plaintext = p.payload.plaintext()?;
                write_protected(&mut buf, header, true, p.packet_number, &plaintext, aead)?;
            }
            Packet::Short(p) => {
                let mut header = BytesMut::new();
                let key_phase = if p.key_phase { KEY_PHASE_BIT } else { 0 };
                header.put_u8(FIXED_BIT | key_phase | (PN_LEN as u8 - 1));
                header.put_slice(p.dest_connection_id.as_bytes());
                let plaintext = p.payload.plaintext()?;
                write_protected(&mut buf, header, false, p.packet_number, &plaintext, aead)?;
            }
            Packet::Retry(p) => {
                buf.put_u8(PacketType::Retry.first_byte());
                p.version.write(&mut buf);
                p.dest_connection_id.write_with_len(&mut buf);
                p.src_connection_id.write_with_len(&mut buf);
                p.original_connection_id.write_with_len(&mut buf);
                buf.put_slice(&p.token);
            }
            Packet::VersionNegotiation(p) => {
                let marker: u8 = rand::thread_rng().r#gen();
                buf.put_u8(LONG_HEADER | marker);
                Version::NEGOTIATION.write(&mut buf);
                p.dest_connection_id.write_with_len(&mut buf);
                p.src_connection_id.write_with_len(&mut buf);
                for version in &p.supported_versions {
                    version.write(&mut buf);
                }
            }
        }
        Ok(buf.freeze())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Initial(p) => write!(
                f,
                "Initial(dcid={}, scid={}, pn={}, frames={})",
                p.dest_connection_id,
                p.src_connection_id,
                p.packet_number,
                p.payload.frames().len()
            ),
            Packet::Handshake(p) => write!(
                f,
                "Handshake(dcid={}, scid={}, pn={}, frames={})",
                p.dest_connection_id,
                p.src_connection_id,
                p.packet_number,
                p.payload.frames().len()
            ),
            Packet::Retry(p) => write!(
                f,
                "Retry(dcid={}, scid={}, odcid={})",
                p.dest_connection_id, p.src_connection_id, p.original_connection_id
            ),
            Packet::VersionNegotiation(p) => write!(
                f,
                "VersionNegotiation(dcid={}, scid={}, versions={:?})",
                p.dest_connection_id, p.src_connection_id, p.supported_versions
            ),
            Packet::Short(p) => write!(
                f,
                "Short(dcid={}, pn={}, frames={})",
                p.dest_connection_id,
                p.packet_number,
                p.payload.frames().len()
            ),
        }
    }
}

/// Seal `plaintext`, then mask the first byte and packet number.
fn write_protected(
    buf: &mut BytesMut,
    mut header: BytesMut,
    long: bool,
    pn: PacketNumber,
    plaintext: &[u8],
    aead: &Aead,
) -> Result<()> {
    if long {
        let length = (PN_LEN + plaintext.len() + TAG_LEN) as u64;
        varint::write_with_len(&mut header, length, LENGTH_FIELD_LEN)?;
    }
    let pn_offset = header.len();
    pn.write(&mut header)?;

    let ciphertext = aead.seal(plaintext, pn, &header)?;
    buf.put_slice(&header);
    buf.put_slice(&ciphertext);

    let sample_offset = pn_offset + PN_LEN;
    let mask = aead.seal_header_mask(&buf[sample_offset..sample_offset + SAMPLE_LEN])?;
    buf[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
    for i in 0..PN_LEN {
        buf[pn_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

fn parse_short_header(data: Bytes, cid_len: usize) -> Result<HalfParsedPacket> {
    let mut buf = data.slice(1..);
    let dest = ConnectionId::read(&mut buf, cid_len)?;
    Ok(HalfParsedPacket {
        inner: HalfParsed::Protected(ProtectedHeader {
            level: EncryptionLevel::OneRtt,
            version: None,
            dest,
            src: None,
            token: Bytes::new(),
            pn_offset: 1 + cid_len,
            data,
        }),
    })
}

fn parse_version_negotiation(mut buf: Bytes) -> Result<VersionNegotiationPacket> {
    let dest = ConnectionId::read_with_len(&mut buf)?;
    let src = ConnectionId::read_with_len(&mut buf)?;
    if buf.is_empty() || buf.remaining() % 4 != 0 {
        return Err(PacketError::InvalidHeader.into());
    }
    let mut supported_versions = Vec::with_capacity(buf.remaining() / 4);
    while buf.has_remaining() {
        supported_versions.push(Version::read(&mut buf)?);
    }
    Ok(VersionNegotiationPacket {
        dest_connection_id: dest,
        src_connection_id: src,
        supported_versions,
    })
}

#[derive(Debug, Clone)]
struct ProtectedHeader {
    level: EncryptionLevel,
    version: Option<Version>,
    dest: ConnectionId,
    src: Option<ConnectionId>,
    token: Bytes,
    pn_offset: usize,
    /// The whole packet, header included
    data: Bytes,
}

#[derive(Debug, Clone)]
enum HalfParsed {
    Complete(Packet),
    Protected(ProtectedHeader),
}

/// A packet whose cleartext header has been read but whose payload is
/// still protected.
#[derive(Debug, Clone)]
pub struct HalfParsedPacket {
    inner: HalfParsed,
}

impl HalfParsedPacket {
    fn complete_packet(packet: Packet) -> Self {
        Self {
            inner: HalfParsed::Complete(packet),
        }
    }

    /// Version from a long header; short headers carry none.
    pub fn version(&self) -> Option<Version> {
        match &self.inner {
            HalfParsed::Complete(Packet::Initial(p)) => Some(p.version),
            HalfParsed::Complete(Packet::Handshake(p)) => Some(p.version),
            HalfParsed::Complete(Packet::Retry(p)) => Some(p.version),
            HalfParsed::Complete(Packet::VersionNegotiation(_)) => Some(Version::NEGOTIATION),
            HalfParsed::Complete(Packet::Short(_)) => None,
            HalfParsed::Protected(h) => h.version,
        }
    }

    pub fn dest_connection_id(&self) -> &ConnectionId {
        match &self.inner {
            HalfParsed::Complete(p) => p.dest_connection_id(),
            HalfParsed::Protected(h) => &h.dest,
        }
    }

    pub fn src_connection_id(&self) -> Option<&ConnectionId> {
        match &self.inner {
            HalfParsed::Complete(p) => p.src_connection_id(),
            HalfParsed::Protected(h) => h.src.as_ref(),
        }
    }

    /// Encryption level needed to finish parsing; `None` for packets that
    /// are already complete.
    pub fn encryption_level(&self) -> Option<EncryptionLevel> {
        match &self.inner {
            HalfParsed::Complete(_) => None,
            HalfParsed::Protected(h) => Some(h.level),
        }
    }

    /// Remove header protection and decrypt the payload with the AEAD the
    /// provider returns for this packet's level.
    pub fn complete<F>(self, aead_provider: F) -> Result<Packet>
    where
        F: FnOnce(EncryptionLevel) -> std::result::Result<Arc<Aead>, ProtocolError>,
    {
        let header = match self.inner {
            HalfParsed::Complete(packet) => return Ok(packet),
            HalfParsed::Protected(header) => header,
        };
        let aead = aead_provider(header.level)?;
        let long = header.level != EncryptionLevel::OneRtt;

        let data = &header.data;
        let sample_offset = header.pn_offset + PN_LEN;
        if data.len() < sample_offset + SAMPLE_LEN {
            return Err(PacketError::TooSmall { size: data.len() }.into());
        }
        let mask = aead.open_header_mask(&data[sample_offset..sample_offset + SAMPLE_LEN])?;

        let mut aad = BytesMut::from(&data[..header.pn_offset]);
        aad[0] ^= mask[0] & if long { 0x0f } else { 0x1f };
        let pn_len = (aad[0] & PN_LEN_MASK) as usize + 1;

        let mut pn = 0u64;
        for i in 0..pn_len {
            let byte = data[header.pn_offset + i] ^ mask[1 + i];
            aad.put_u8(byte);
            pn = (pn << 8) | u64::from(byte);
        }
        let packet_number = PacketNumber::new(pn);
        let key_phase = aad[0] & KEY_PHASE_BIT != 0;

        let plaintext = aead.open(&data[header.pn_offset + pn_len..], packet_number, &aad)?;
        let payload = Payload::parse(&plaintext)?;

        let packet = match header.level {
            EncryptionLevel::Initial => Packet::Initial(InitialPacket {
                version: header.version.ok_or(PacketError::InvalidHeader)?,
                dest_connection_id: header.dest,
                src_connection_id: header.src.ok_or(PacketError::InvalidHeader)?,
                token: header.token,
                packet_number,
                payload,
            }),
            EncryptionLevel::Handshake => Packet::Handshake(HandshakePacket {
                version: header.version.ok_or(PacketError::InvalidHeader)?,
                dest_connection_id: header.dest,
                src_connection_id: header.src.ok_or(PacketError::InvalidHeader)?,
                packet_number,
                payload,
            }),
            EncryptionLevel::OneRtt => Packet::Short(ShortPacket {
                key_phase,
                dest_connection_id: header.dest,
                packet_number,
                payload,
            }),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_schedule;
    use crate::quic::error::QuicError;
    use crate::quic::connection_id::MAX_CONNECTION_ID_LENGTH;
    use crate::quic::frame::{AckBlock, AckFrame};

    fn aeads() -> (Arc<Aead>, Arc<Aead>) {
        let cid = ConnectionId::random();
        (
            Arc::new(key_schedule::initial_aead(&cid, true).unwrap()),
            Arc::new(key_schedule::initial_aead(&cid, false).unwrap()),
        )
    }

    fn roundtrip(packet: Packet, cid_len: usize) -> Packet {
        let (client, server) = aeads();
        let bytes = packet.write(&client).unwrap();
        Packet::parse_header(bytes, cid_len)
            .unwrap()
            .complete(|_| Ok(server.clone()))
            .unwrap()
    }

    fn ping() -> Payload {
        Payload::single(Frame::Ping)
    }

    #[test]
    fn test_initial_is_padded_to_minimum() {
        let (client, server) = aeads();
        let packet = Packet::Initial(InitialPacket {
            version: Version::CURRENT,
            dest_connection_id: ConnectionId::random(),
            src_connection_id: ConnectionId::random(),
            token: Bytes::from_static(b"token"),
            packet_number: PacketNumber::new(3),
            payload: ping(),
        });
        let bytes = packet.write(&client).unwrap();
        assert_eq!(bytes.len(), MIN_INITIAL_PACKET_SIZE);

        let parsed = Packet::parse_header(bytes, 8)
            .unwrap()
            .complete(|_| Ok(server.clone()))
            .unwrap();
        match parsed {
            Packet::Initial(p) => {
                assert_eq!(p.token, Bytes::from_static(b"token"));
                assert_eq!(p.packet_number, PacketNumber::new(3));
                assert_eq!(p.payload.frames()[0], Frame::Ping);
                assert!(matches!(p.payload.frames()[1], Frame::Padding { .. }));
            }
            other => panic!("unexpected packet {}", other),
        }
    }

    #[test]
    fn test_explicitly_padded_initial_roundtrips() {
        // header: 1 + 4 + (1 + 20) + (1 + 0) + token len 1 + length 2 + pn 4 = 34
        // crypto frame: type 1 + offset 1 + len 2 + 100 data = 104
        let unpadded = 34 + 104 + TAG_LEN;
        let packet = Packet::Initial(InitialPacket {
            version: Version::CURRENT,
            dest_connection_id: ConnectionId::random_with_len(MAX_CONNECTION_ID_LENGTH),
            src_connection_id: ConnectionId::from_bytes(Bytes::new()).unwrap(),
            token: Bytes::new(),
            packet_number: PacketNumber::new(0),
            payload: Payload::new(vec![
                Frame::crypto(0, vec![1u8; 100]),
                Frame::Padding {
                    length: MIN_INITIAL_PACKET_SIZE - unpadded,
                },
            ])
            .unwrap(),
        });
        let (client, _) = aeads();
        assert_eq!(packet.write(&client).unwrap().len(), MIN_INITIAL_PACKET_SIZE);
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let packet = Packet::Handshake(HandshakePacket {
            version: Version::CURRENT,
            dest_connection_id: ConnectionId::random(),
            src_connection_id: ConnectionId::random(),
            packet_number: PacketNumber::new(70_000),
            payload: Payload::new(vec![
                Frame::Ack(AckFrame::new(0, vec![AckBlock::single(PacketNumber::new(1))]).unwrap()),
                Frame::crypto(0, vec![0x14, 0, 0, 1, 9]),
            ])
            .unwrap(),
        });
        assert_eq!(roundtrip(packet.clone(), 8), packet);
    }

    #[test]
    fn test_short_roundtrip() {
        let dest = ConnectionId::random_with_len(12);
        for key_phase in [false, true] {
            let packet = Packet::Short(ShortPacket {
                key_phase,
                dest_connection_id: dest.clone(),
                packet_number: PacketNumber::new(1),
                payload: ping(),
            });
            assert_eq!(roundtrip(packet.clone(), 12), packet);
        }
    }

    #[test]
    fn test_retry_roundtrip() {
        let packet = Packet::Retry(RetryPacket {
            version: Version::CURRENT,
            dest_connection_id: ConnectionId::random(),
            src_connection_id: ConnectionId::random(),
            original_connection_id: ConnectionId::random(),
            token: Bytes::from_static(&[1, 2, 3, 4]),
        });
        assert_eq!(roundtrip(packet.clone(), 8), packet);

        let empty_token = Packet::Retry(RetryPacket {
            version: Version::CURRENT,
            dest_connection_id: ConnectionId::random(),
            src_connection_id: ConnectionId::random(),
            original_connection_id: ConnectionId::random(),
            token: Bytes::new(),
        });
        assert_eq!(roundtrip(empty_token.clone(), 8), empty_token);
    }

    #[test]
    fn test_version_negotiation_roundtrip_and_marker() {
        let packet = Packet::VersionNegotiation(VersionNegotiationPacket {
            dest_connection_id: ConnectionId::random(),
            src_connection_id: ConnectionId::random(),
            supported_versions: vec![Version::CURRENT, Version::FINAL],
        });
        let (client, _) = aeads();
        let bytes = packet.write(&client).unwrap();
        assert_eq!(bytes[0] & 0x80, 0x80);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);

        let half = Packet::parse_header(bytes, 8).unwrap();
        assert_eq!(half.version(), Some(Version::NEGOTIATION));
        assert_eq!(half.encryption_level(), None);
        assert_eq!(
            half.complete(|level| Err(ProtocolError::MissingAead(level))).unwrap(),
            packet
        );
    }

    #[test]
    fn test_half_parsed_exposes_header() {
        let (client, _) = aeads();
        let dest = ConnectionId::random();
        let packet = Packet::Handshake(HandshakePacket {
            version: Version::CURRENT,
            dest_connection_id: dest.clone(),
            src_connection_id: ConnectionId::random(),
            packet_number: PacketNumber::new(0),
            payload: ping(),
        });
        let half = Packet::parse_header(packet.write(&client).unwrap(), 8).unwrap();
        assert_eq!(half.version(), Some(Version::CURRENT));
        assert_eq!(half.dest_connection_id(), &dest);
        assert_eq!(half.encryption_level(), Some(EncryptionLevel::Handshake));
    }

    #[test]
    fn test_wrong_key_is_authentication_error() {
        let (client, _) = aeads();
        let (_, other_server) = aeads();
        let packet = Packet::Short(ShortPacket {
            key_phase: false,
            dest_connection_id: ConnectionId::random(),
            packet_number: PacketNumber::new(5),
            payload: ping(),
        });
        let err = Packet::parse_header(packet.write(&client).unwrap(), 8)
            .unwrap()
            .complete(|_| Ok(other_server.clone()))
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_decode_errors() {
        assert!(Packet::parse_header(Bytes::new(), 8).unwrap_err().is_decode());

        // 0-RTT long header type is not accepted
        let mut zero_rtt = BytesMut::new();
        zero_rtt.put_u8(0xd3);
        Version::CURRENT.write(&mut zero_rtt);
        zero_rtt.put_u8(0);
        zero_rtt.put_u8(0);
        assert!(matches!(
            Packet::parse_header(zero_rtt.freeze(), 8),
            Err(QuicError::Packet(PacketError::UnsupportedType(1)))
        ));

        // truncated connection ID
        let truncated = Bytes::from_static(&[0xc3, 0xff, 0x00, 0x00, 0x11, 0x08, 0x01]);
        assert!(Packet::parse_header(truncated, 8).unwrap_err().is_decode());

        // version negotiation without versions
        let empty_vn = Bytes::from_static(&[0x80, 0, 0, 0, 0, 0, 0]);
        assert!(Packet::parse_header(empty_vn, 8).unwrap_err().is_decode());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            Payload::new(vec![]),
            Err(QuicError::Packet(PacketError::EmptyPayload))
        ));
        assert_eq!(ping().encoded_len().unwrap(), 1 + TAG_LEN);
    }

    #[test]
    fn test_packet_number_beyond_four_bytes_is_rejected() {
        let (client, _) = aeads();
        let short = |pn: u64| {
            Packet::Short(ShortPacket {
                key_phase: false,
                dest_connection_id: ConnectionId::random(),
                packet_number: PacketNumber::new(pn),
                payload: ping(),
            })
        };
        assert!(short(u64::from(u32::MAX)).write(&client).is_ok());
        assert!(matches!(
            short(1 << 32).write(&client),
            Err(QuicError::Packet(PacketError::PacketNumberTooLarge(0x1_0000_0000)))
        ));
    }
}
