//! Server connections, the connection registry and the datagram router.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::quic::connection::PacketSender;
use crate::quic::error::Result;
use crate::quic::udp_mux::UdpMultiplexer;
use crate::tls::TransportParameters;

pub mod builder;
pub mod connection;
pub mod connections;
pub mod handler;
pub mod router;
pub mod state_machine;

pub use builder::QuicServerBuilder;
pub use connection::ServerConnection;
pub use connections::Connections;
pub use handler::EchoHandler;
pub use router::PacketRouter;
pub use state_machine::ServerState;

/// Material shared by every connection of a server.
#[derive(Clone)]
pub struct ServerContext {
    /// DER certificates, leaf first
    pub certificates: Vec<Bytes>,
    /// PKCS#8 ECDSA P-256 key for the leaf certificate
    pub private_key: Bytes,
    pub transport_parameters: TransportParameters,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("certificates", &self.certificates.len())
            .field("transport_parameters", &self.transport_parameters)
            .finish_non_exhaustive()
    }
}

/// A QUIC server: a connection registry plus the router feeding it.
#[derive(Debug, Clone)]
pub struct QuicServer {
    router: Arc<PacketRouter>,
}

impl QuicServer {
    pub fn builder() -> QuicServerBuilder {
        QuicServerBuilder::new()
    }

    pub fn new(router: PacketRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Arc<PacketRouter> {
        &self.router
    }

    pub fn connections(&self) -> &Arc<Connections> {
        self.router.connections()
    }

    /// Feed one datagram from any transport.
    pub async fn route(&self, datagram: Bytes, sender: Arc<dyn PacketSender>) -> Result<Option<ServerConnection>> {
        self.router.route(datagram, sender).await
    }

    /// Serve over UDP until ctrl-c.
    pub async fn run(self, bind_addr: SocketAddr) -> Result<()> {
        let mux = UdpMultiplexer::bind(bind_addr).await?;
        info!("QUIC server listening on {}", mux.local_addr());

        tokio::select! {
            result = mux.serve(self.router.clone()) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, closing server");
            }
        }
        self.close().await;
        Ok(())
    }

    /// Close every connection.
    pub async fn close(&self) {
        let connections = self.connections();
        connections.close_all().await;
        let pruned = connections.prune_closed();
        info!("Closed {} connections", pruned);
    }
}
