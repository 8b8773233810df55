//! Wire-level checks through the public API: what a client puts on the
//! wire must be readable by a server that only knows the bytes.

use bytes::Bytes;
use nquic::crypto::initial_aead;
use nquic::quic::frame::{AckBlock, AckFrame, Frame};
use nquic::quic::loopback::LoopbackSender;
use nquic::quic::packet::{HandshakePacket, InitialPacket, Packet, PacketNumber, Payload, VersionNegotiationPacket};
use nquic::quic::{ConnectionId, Version};
use nquic::tls::extensions::{find, Extension};
use nquic::tls::messages::HandshakeMessage;
use nquic::tls::TransportParameters;
use nquic::ClientConnection;
use std::sync::Arc;

#[test]
fn test_ack_frame_literal() {
    let ack = AckFrame::new(
        1234,
        vec![AckBlock::new(PacketNumber::new(100), PacketNumber::new(100)).unwrap()],
    )
    .unwrap();
    let encoded = Frame::Ack(ack.clone()).encode().unwrap();
    assert_eq!(hex::encode(&encoded), "02406444d20000");

    let mut buf = encoded;
    assert_eq!(Frame::decode(&mut buf).unwrap(), Frame::Ack(ack));
}

#[tokio::test]
async fn test_client_initial_is_readable_by_server() {
    let (sender, mut rx) = LoopbackSender::channel();
    let dcid = ConnectionId::random();
    let params = TransportParameters {
        version: Version::CURRENT,
        idle_timeout: Some(10),
        ..Default::default()
    };
    let client = ClientConnection::builder()
        .remote_connection_id(dcid.clone())
        .transport_parameters(params.clone())
        .sender(sender)
        .build()
        .unwrap();
    client.handshake().await.unwrap();

    let datagram = rx.recv().await.unwrap();
    assert!(datagram.len() >= 1200);

    let half = Packet::parse_header(datagram, 8).unwrap();
    assert_eq!(half.version(), Some(Version::CURRENT));
    assert_eq!(half.dest_connection_id(), &dcid);
    assert_eq!(half.src_connection_id(), Some(client.local_connection_id()));

    let server_aead = Arc::new(initial_aead(&dcid, false).unwrap());
    let Packet::Initial(initial) = half.complete(|_| Ok(server_aead)).unwrap() else {
        panic!("expected an Initial packet");
    };
    assert_eq!(initial.packet_number, PacketNumber::new(0));
    assert!(initial.token.is_empty());

    let Some(Frame::Crypto { offset: 0, data, .. }) = initial.payload.frames().first().cloned() else {
        panic!("expected CRYPTO first");
    };
    let mut data = data;
    let (message, _) = HandshakeMessage::parse(&mut data).unwrap().unwrap();
    let HandshakeMessage::ClientHello(hello) = message else {
        panic!("expected ClientHello");
    };
    assert_eq!(hello.cipher_suites, vec![0x1301]);
    let sent = find(&hello.extensions, |e| match e {
        Extension::TransportParameters(p) => Some(p.clone()),
        _ => None,
    });
    assert_eq!(sent, Some(params));
}

#[test]
fn test_max_length_connection_ids_roundtrip() {
    let dcid = ConnectionId::random_with_len(20);
    let scid = ConnectionId::random_with_len(20);
    let aead = initial_aead(&dcid, true).unwrap();
    let packet = Packet::Handshake(HandshakePacket {
        version: Version::CURRENT,
        dest_connection_id: dcid.clone(),
        src_connection_id: scid,
        packet_number: PacketNumber::new(0x1234),
        payload: Payload::new(vec![Frame::Ping, Frame::crypto(0, Bytes::from_static(b"x"))]).unwrap(),
    });

    let datagram = packet.write(&aead).unwrap();
    let peer = Arc::new(initial_aead(&dcid, false).unwrap());
    let parsed = Packet::parse_header(datagram, 0)
        .unwrap()
        .complete(|_| Ok(peer))
        .unwrap();
    assert_eq!(parsed, packet);
}

#[test]
fn test_initial_with_token_roundtrip() {
    let dcid = ConnectionId::random();
    let aead = initial_aead(&dcid, true).unwrap();
    let packet = Packet::Initial(InitialPacket {
        version: Version::CURRENT,
        dest_connection_id: dcid.clone(),
        src_connection_id: ConnectionId::random_with_len(0),
        token: Bytes::from_static(b"retry-token"),
        packet_number: PacketNumber::new(1),
        payload: Payload::single(Frame::crypto(0, Bytes::from_static(b"hello"))),
    });

    let datagram = packet.write(&aead).unwrap();
    assert_eq!(datagram.len(), 1200);
    let peer = Arc::new(initial_aead(&dcid, false).unwrap());
    let Packet::Initial(parsed) = Packet::parse_header(datagram, 0)
        .unwrap()
        .complete(|_| Ok(peer))
        .unwrap()
    else {
        panic!("expected an Initial packet");
    };
    assert_eq!(parsed.token, Bytes::from_static(b"retry-token"));
    assert!(matches!(parsed.payload.frames(), [Frame::Crypto { .. }, Frame::Padding { .. }]));
}

#[test]
fn test_version_negotiation_layout() {
    let dcid = ConnectionId::from_bytes(vec![1u8, 2, 3, 4]).unwrap();
    let scid = ConnectionId::from_bytes(vec![5u8, 6]).unwrap();
    let packet = Packet::VersionNegotiation(VersionNegotiationPacket {
        dest_connection_id: dcid,
        src_connection_id: scid,
        supported_versions: vec![Version::CURRENT, Version::FINAL],
    });
    let aead = initial_aead(&ConnectionId::random(), true).unwrap();
    let datagram = packet.write(&aead).unwrap();

    assert_eq!(datagram[0] & 0x80, 0x80);
    assert_eq!(
        hex::encode(&datagram[1..]),
        "00000000\
         0401020304\
         020506\
         ff000011\
         00000001"
    );
}
