//! UDP transport: one socket per endpoint, one datagram per packet.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::PacketSender;
use super::error::Result;
use super::packet::Packet;
use crate::client::ClientConnection;
use crate::crypto::Aead;
use crate::server::PacketRouter;

/// Largest datagram we will read
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Sends packets to one fixed peer over a shared socket.
#[derive(Debug, Clone)]
pub struct UdpPacketSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpPacketSender {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl PacketSender for UdpPacketSender {
    async fn send(&self, packet: &Packet, aead: &Aead) -> Result<()> {
        let datagram = packet.write(aead)?;
        let sent = self.socket.send_to(&datagram, self.peer).await?;
        debug!("Sent {} bytes to {}", sent, self.peer);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        debug!("Released UDP path to {}", self.peer);
        Ok(())
    }
}

/// A bound UDP socket shared by every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct UdpMultiplexer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpMultiplexer {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP multiplexer bound to {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender for packets addressed to `peer`.
    pub fn sender_for(&self, peer: SocketAddr) -> Arc<dyn PacketSender> {
        Arc::new(UdpPacketSender::new(self.socket.clone(), peer))
    }

    /// Feed every received datagram to `router`. Only socket errors end
    /// the loop; bad datagrams are logged and dropped.
    pub async fn serve(&self, router: Arc<PacketRouter>) -> Result<()> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, source) = self.socket.recv_from(&mut buffer).await?;
            let datagram = Bytes::copy_from_slice(&buffer[..len]);
            match router.route(datagram, self.sender_for(source)).await {
                Ok(Some(connection)) => {
                    debug!("Routed {} bytes from {} to {}", len, source, connection.local_connection_id());
                }
                Ok(None) => {}
                Err(e) if e.is_decode() => {
                    debug!("Dropping undecodable datagram from {}: {}", source, e);
                }
                Err(e) => {
                    warn!("Error handling datagram from {}: {}", source, e);
                }
            }
            router.connections().prune_closed();
        }
    }

    /// Deliver datagrams arriving from `peer` to `client` until the
    /// connection closes or the socket fails.
    pub fn spawn_client_receiver(&self, client: ClientConnection, peer: SocketAddr) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            let mut state = client.subscribe();
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => {
                        let (len, source) = match received {
                            Ok(received) => received,
                            Err(e) => {
                                error!("Error receiving UDP datagram: {}", e);
                                return;
                            }
                        };
                        if source != peer {
                            debug!("Ignoring datagram from unknown peer {}", source);
                            continue;
                        }
                        let datagram = Bytes::copy_from_slice(&buffer[..len]);
                        if let Err(e) = client.on_datagram(datagram).await {
                            warn!("Error handling datagram from {}: {}", source, e);
                        }
                    }
                    changed = state.changed() => {
                        if changed.is_err() || state.borrow().is_closed() {
                            debug!("Client connection closed, stopping receiver");
                            return;
                        }
                    }
                }
            }
        })
    }
}
