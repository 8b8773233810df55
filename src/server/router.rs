//! Demultiplexes incoming datagrams onto server connections.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::ServerConnection;
use super::connections::Connections;
use super::state_machine::ServerState;
use crate::crypto::key_schedule::initial_aead;
use crate::crypto::EncryptionLevel;
use crate::quic::connection::{is_droppable, PacketSender};
use crate::quic::connection_id::{ConnectionId, DEFAULT_CONNECTION_ID_LENGTH};
use crate::quic::error::Result;
use crate::quic::packet::{HalfParsedPacket, Packet, VersionNegotiationPacket};
use crate::quic::stream::StreamListener;
use crate::quic::version::{supported_versions, Version};

pub struct PacketRouter {
    connections: Arc<Connections>,
    listener: Arc<dyn StreamListener>,
    /// Length of the connection ids this server hands out; short headers
    /// are parsed with it.
    connection_id_length: usize,
}

impl PacketRouter {
    pub fn new(connections: Arc<Connections>, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            connections,
            listener,
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
        }
    }

    pub fn with_connection_id_length(mut self, len: usize) -> Self {
        self.connection_id_length = len;
        self
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    /// Handle one datagram. `sender` reaches the datagram's source and is
    /// used for any connection created here. Returns the connection the
    /// packet went to, if any.
    pub async fn route(
        &self,
        datagram: Bytes,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Option<ServerConnection>> {
        let half = Packet::parse_header(datagram, self.connection_id_length)?;

        if let Some(version) = half.version() {
            if version.is_negotiation() {
                debug!("Ignoring Version Negotiation packet sent to a server");
                return Ok(None);
            }
            if !version.is_supported() {
                self.send_version_negotiation(&half, version, sender).await?;
                return Ok(None);
            }
        }

        let dcid = half.dest_connection_id().clone();
        if let Some(connection) = self.connections.get(&dcid) {
            connection.on_half_parsed(half).await?;
            return Ok(Some(connection));
        }
        if half.encryption_level() != Some(EncryptionLevel::Initial) {
            debug!("No connection for {}, dropping packet", dcid);
            return Ok(None);
        }
        self.accept(dcid, half, sender).await
    }

    /// Open an Initial for an unknown id with the keys that id implies and
    /// register a connection only if it carried a usable ClientHello.
    async fn accept(
        &self,
        dcid: ConnectionId,
        half: HalfParsedPacket,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Option<ServerConnection>> {
        let aead = Arc::new(initial_aead(&dcid, false)?);
        let packet = match half.complete(|_| Ok(aead)) {
            Ok(packet) => packet,
            Err(e) if is_droppable(&e) => {
                debug!("Dropping unauthenticated Initial for {}: {}", dcid, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let connection = self
            .connections
            .get_or_create(Some(dcid.clone()), self.listener.clone(), sender)?;
        let handled = connection.on_packet(packet).await;
        if connection.state() == ServerState::BeforeInitial {
            debug!("Initial for {} did not start a handshake, forgetting it", dcid);
            self.connections.remove(&dcid);
            return handled.map(|_| None);
        }
        handled.map(|_| Some(connection))
    }

    async fn send_version_negotiation(
        &self,
        half: &HalfParsedPacket,
        offered: Version,
        sender: Arc<dyn PacketSender>,
    ) -> Result<()> {
        let Some(src) = half.src_connection_id() else {
            return Ok(());
        };
        info!("Client offered unsupported version {}, sending Version Negotiation", offered);
        let packet = Packet::VersionNegotiation(VersionNegotiationPacket {
            dest_connection_id: src.clone(),
            src_connection_id: half.dest_connection_id().clone(),
            supported_versions: supported_versions().to_vec(),
        });
        // not encrypted, any AEAD will do
        let aead = initial_aead(half.dest_connection_id(), false)?;
        sender.send(&packet, &aead).await
    }
}

impl std::fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouter")
            .field("connections", &self.connections)
            .field("connection_id_length", &self.connection_id_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConnection;
    use crate::quic::connection::test_support::RecordingSender;
    use crate::quic::frame::Frame;
    use crate::quic::loopback::LoopbackSender;
    use crate::quic::packet::{InitialPacket, PacketNumber, Payload};
    use crate::quic::stream::NoopStreamListener;
    use crate::server::tests::test_context;

    fn router() -> PacketRouter {
        PacketRouter::new(
            Arc::new(Connections::new(Arc::new(test_context()))),
            Arc::new(NoopStreamListener),
        )
    }

    fn initial(version: Version, dcid: &ConnectionId, scid: &ConnectionId) -> Bytes {
        let packet = Packet::Initial(InitialPacket {
            version,
            dest_connection_id: dcid.clone(),
            src_connection_id: scid.clone(),
            token: Bytes::new(),
            packet_number: PacketNumber::new(0),
            payload: Payload::single(Frame::Ping),
        });
        packet.write(&initial_aead(dcid, true).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_version_gets_negotiation() {
        let router = router();
        let sender = Arc::new(RecordingSender::default());
        let dcid = ConnectionId::random();
        let scid = ConnectionId::random();

        let routed = router
            .route(initial(Version::FINAL, &dcid, &scid), sender.clone())
            .await
            .unwrap();
        assert!(routed.is_none());
        assert!(router.connections().is_empty());

        let packets = sender.packets.lock();
        let [Packet::VersionNegotiation(vn)] = packets.as_slice() else {
            panic!("expected a single Version Negotiation packet");
        };
        assert_eq!(vn.dest_connection_id, scid);
        assert_eq!(vn.src_connection_id, dcid);
        assert_eq!(vn.supported_versions, vec![Version::CURRENT]);
    }

    #[tokio::test]
    async fn test_initial_without_client_hello_is_forgotten() {
        let router = router();
        let sender = Arc::new(RecordingSender::default());
        let dcid = ConnectionId::random();

        let routed = router
            .route(initial(Version::CURRENT, &dcid, &ConnectionId::random()), sender.clone())
            .await
            .unwrap();
        assert!(routed.is_none());
        assert!(router.connections().is_empty());
        assert!(sender.packets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forged_initials_leave_no_connections() {
        let router = router();
        let sender = Arc::new(RecordingSender::default());

        for _ in 0..100 {
            let dcid = ConnectionId::random();
            let packet = Packet::Initial(InitialPacket {
                version: Version::CURRENT,
                dest_connection_id: dcid,
                src_connection_id: ConnectionId::random(),
                token: Bytes::new(),
                packet_number: PacketNumber::new(0),
                payload: Payload::single(Frame::Ping),
            });
            // sealed with keys for some other id
            let forged = packet.write(&initial_aead(&ConnectionId::random(), true).unwrap()).unwrap();
            assert!(router.route(forged, sender.clone()).await.unwrap().is_none());
        }
        assert!(router.connections().is_empty());
        assert_eq!(router.connections().prune_closed(), 0);
    }

    #[tokio::test]
    async fn test_client_hello_creates_connection() {
        let router = router();
        let (sender, mut datagrams) = LoopbackSender::channel();
        let client = ClientConnection::builder().sender(sender).build().unwrap();
        client.handshake().await.unwrap();
        let dcid = client.remote_connection_id().await;

        let replies = Arc::new(RecordingSender::default());
        let connection = router
            .route(datagrams.recv().await.unwrap(), replies.clone())
            .await
            .unwrap()
            .expect("connection for a ClientHello");
        assert_eq!(connection.local_connection_id(), &dcid);
        assert_eq!(connection.state(), ServerState::WaitingForFinished);
        assert_eq!(router.connections().len(), 1);
        assert_eq!(replies.packets.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_short_header_is_dropped() {
        let router = router();
        let sender = Arc::new(RecordingSender::default());
        let mut datagram = vec![0x40u8];
        datagram.extend_from_slice(ConnectionId::random().as_bytes());
        datagram.extend_from_slice(&[0u8; 40]);

        let routed = router.route(Bytes::from(datagram), sender.clone()).await.unwrap();
        assert!(routed.is_none());
        assert!(sender.packets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_is_a_decode_error() {
        let router = router();
        let sender = Arc::new(RecordingSender::default());
        let err = router
            .route(Bytes::from_static(&[0xc0, 0xff]), sender)
            .await
            .unwrap_err();
        assert!(err.is_decode());
    }
}
