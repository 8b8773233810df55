//! In-process transport: serialized packets travel over unbounded channels
//! instead of a socket. Used to run a client against a server without
//! touching the network.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::PacketSender;
use super::error::Result;
use super::packet::Packet;
use crate::client::{ClientConnection, ClientConnectionBuilder};
use crate::crypto::Aead;
use crate::server::QuicServer;

/// One direction of a loopback link.
#[derive(Debug)]
pub struct LoopbackSender {
    tx: mpsc::UnboundedSender<Bytes>,
    destroyed: AtomicBool,
    datagrams: AtomicU64,
}

impl LoopbackSender {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(Self {
            tx,
            destroyed: AtomicBool::new(false),
            datagrams: AtomicU64::new(0),
        });
        (sender, rx)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Datagrams handed to the channel so far
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PacketSender for LoopbackSender {
    async fn send(&self, packet: &Packet, aead: &Aead) -> Result<()> {
        let datagram = packet.write(aead)?;
        if self.is_destroyed() {
            debug!("Loopback destroyed, dropping {} byte datagram", datagram.len());
            return Ok(());
        }
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        // the far end going away looks like loss
        if self.tx.send(datagram).is_err() {
            debug!("Loopback peer gone, datagram lost");
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A client wired to a server through two loopback channels.
pub struct Loopback {
    pub client: ClientConnection,
    pub to_server: Arc<LoopbackSender>,
    pub to_client: Arc<LoopbackSender>,
    pumps: Vec<JoinHandle<()>>,
}

impl Loopback {
    /// Build the client from `builder` and start pumping datagrams in both
    /// directions. The handshake is not started.
    pub fn connect(server: &QuicServer, builder: ClientConnectionBuilder) -> Result<Self> {
        let (to_server, mut server_rx) = LoopbackSender::channel();
        let (to_client, mut client_rx) = LoopbackSender::channel();

        let client = builder.sender(to_server.clone()).build()?;

        let server = server.clone();
        let reply: Arc<dyn PacketSender> = to_client.clone();
        let server_pump = tokio::spawn(async move {
            while let Some(datagram) = server_rx.recv().await {
                if let Err(e) = server.route(datagram, reply.clone()).await {
                    warn!("Server dropped loopback datagram: {}", e);
                }
            }
        });

        let receiver = client.clone();
        let client_pump = tokio::spawn(async move {
            while let Some(datagram) = client_rx.recv().await {
                if let Err(e) = receiver.on_datagram(datagram).await {
                    warn!("Client dropped loopback datagram: {}", e);
                }
            }
        });

        Ok(Self {
            client,
            to_server,
            to_client,
            pumps: vec![server_pump, client_pump],
        })
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::initial_aead;
    use crate::quic::connection_id::ConnectionId;
    use crate::quic::frame::Frame;
    use crate::quic::packet::{InitialPacket, PacketNumber, Payload};
    use crate::quic::version::Version;

    #[tokio::test]
    async fn test_destroyed_sender_drops() {
        let (sender, mut rx) = LoopbackSender::channel();
        let dcid = ConnectionId::random();
        let aead = initial_aead(&dcid, true).unwrap();
        let packet = Packet::Initial(InitialPacket {
            version: Version::CURRENT,
            dest_connection_id: dcid,
            src_connection_id: ConnectionId::random(),
            token: Bytes::new(),
            packet_number: PacketNumber::new(0),
            payload: Payload::single(Frame::Ping),
        });

        sender.send(&packet, &aead).await.unwrap();
        let datagram = rx.recv().await.unwrap();
        assert!(datagram.len() >= 1200);

        sender.destroy().await.unwrap();
        sender.send(&packet, &aead).await.unwrap();
        assert_eq!(sender.datagrams(), 1);
        assert!(rx.try_recv().is_err());
    }
}
