//! QUIC protocol implementation
//!
//! Wire codec (varints, frames, packets), packet numbering and
//! acknowledgement bookkeeping, streams, and the transports that carry
//! datagrams.

pub mod connection;
pub mod connection_id;
pub mod error;
pub mod frame;
pub mod loopback;
pub mod packet;
pub mod packet_buffer;
pub mod stream;
pub mod udp_mux;
pub mod varint;
pub mod version;

// Re-export commonly used items
pub use connection::{ConnectionStats, PacketSender};
pub use connection_id::ConnectionId;
pub use error::{CryptoError, FrameError, PacketError, ProtocolError, QuicError, Result, TlsError};
pub use frame::{AckBlock, AckFrame, Frame};
pub use loopback::{Loopback, LoopbackSender};
pub use packet::{HalfParsedPacket, Packet, PacketNumber, Payload};
pub use packet_buffer::PacketBuffer;
pub use stream::{NoopStreamListener, Stream, StreamId, StreamListener};
pub use udp_mux::{UdpMultiplexer, UdpPacketSender};
pub use version::Version;
