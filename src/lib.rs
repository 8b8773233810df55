// Wire codec, packet numbering, streams and transports
pub mod quic;

// Client and server connection state machines
pub mod client;
pub mod server;

// Packet protection and key schedule
pub mod crypto;

// TLS 1.3 handshake carried in CRYPTO frames
pub mod tls;

pub mod config;

// Re-export main types
pub use client::{ClientConnection, ClientState};
pub use quic::{ConnectionId, Packet, QuicError, Result, Stream, StreamId, StreamListener, Version};
pub use server::{QuicServer, ServerConnection, ServerState};

pub mod prelude {
    pub use crate::client::{ClientConnection, ClientConnectionBuilder, ClientState};
    pub use crate::config::QuicConfig;
    pub use crate::quic::{
        ConnectionId, Loopback, NoopStreamListener, PacketSender, QuicError, Result, Stream, StreamId,
        StreamListener, UdpMultiplexer, Version,
    };
    pub use crate::server::{EchoHandler, QuicServer, QuicServerBuilder, ServerConnection, ServerState};
}
