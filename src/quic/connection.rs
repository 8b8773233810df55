//! State shared by client and server connections: identifiers, keys,
//! packet number spaces, reliability bookkeeping and streams.
//!
//! The owning connection keeps a [`ConnectionCore`] behind its per-connection
//! mutex, so everything here runs with exclusive access.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::connection_id::ConnectionId;
use super::error::{ProtocolError, QuicError, Result};
use super::frame::{Frame, NO_ERROR};
use super::packet::{
    HalfParsedPacket, HandshakePacket, InitialPacket, Packet, PacketNumber, Payload, ShortPacket,
};
use super::packet_buffer::PacketBuffer;
use super::stream::{StreamEvent, StreamListener, Streams};
use super::version::Version;
use crate::crypto::aead::{Aead, AeadSet};
use crate::crypto::EncryptionLevel;

/// Outgoing datagram path. Implementations serialize the packet with the
/// given AEAD and hand it to the network.
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send(&self, packet: &Packet, aead: &Aead) -> Result<()>;

    /// Release the transport once the connection is closed.
    async fn destroy(&self) -> Result<()>;
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
}

pub(crate) struct ConnectionCore {
    pub local_cid: ConnectionId,
    pub remote_cid: ConnectionId,
    pub version: Version,
    pub aeads: AeadSet,
    pub buffer: PacketBuffer,
    next_pn: [PacketNumber; 3],
    /// Retry token echoed in Initial packets; empty when none
    pub token: Bytes,
    pub streams: Streams,
    pub listener: Arc<dyn StreamListener>,
    pub stats: ConnectionStats,
    sender: Arc<dyn PacketSender>,
    events: Vec<StreamEvent>,
}

impl ConnectionCore {
    pub fn new(
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        version: Version,
        initial_aead: Aead,
        streams: Streams,
        listener: Arc<dyn StreamListener>,
        sender: Arc<dyn PacketSender>,
    ) -> Self {
        Self {
            local_cid,
            remote_cid,
            version,
            aeads: AeadSet::new(initial_aead),
            buffer: PacketBuffer::new(),
            next_pn: [PacketNumber::MIN; 3],
            token: Bytes::new(),
            streams,
            listener,
            stats: ConnectionStats::default(),
            sender,
            events: Vec::new(),
        }
    }

    fn next_packet_number(&mut self, level: EncryptionLevel) -> PacketNumber {
        let slot = &mut self.next_pn[level.index()];
        let pn = *slot;
        *slot = pn.next();
        pn
    }

    /// Restart the Initial packet number space, as required after a Retry.
    pub fn reset_initial_space(&mut self) {
        self.next_pn[EncryptionLevel::Initial.index()] = PacketNumber::MIN;
        self.buffer.reset(EncryptionLevel::Initial);
    }

    fn build_packet(&mut self, level: EncryptionLevel, payload: Payload) -> Packet {
        let packet_number = self.next_packet_number(level);
        match level {
            EncryptionLevel::Initial => Packet::Initial(InitialPacket {
                version: self.version,
                dest_connection_id: self.remote_cid.clone(),
                src_connection_id: self.local_cid.clone(),
                token: self.token.clone(),
                packet_number,
                payload,
            }),
            EncryptionLevel::Handshake => Packet::Handshake(HandshakePacket {
                version: self.version,
                dest_connection_id: self.remote_cid.clone(),
                src_connection_id: self.local_cid.clone(),
                packet_number,
                payload,
            }),
            EncryptionLevel::OneRtt => Packet::Short(ShortPacket {
                key_phase: false,
                dest_connection_id: self.remote_cid.clone(),
                packet_number,
                payload,
            }),
        }
    }

    /// Send `frames` in one packet at `level`, attaching any pending ACK
    /// for that level.
    pub async fn send_frames(&mut self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<()> {
        let aead = self.aeads.get(level)?;
        let mut payload = Payload::new(frames)?;
        if self.buffer.needs_ack(level) {
            if let Some(ack) = self.buffer.take_ack_frame(level) {
                payload.push(ack);
            }
        }
        let packet = self.build_packet(level, payload);
        self.transmit(packet, &aead).await
    }

    /// Send an ACK-only packet for every level that owes one.
    pub async fn flush_acks(&mut self) -> Result<()> {
        for level in EncryptionLevel::ALL {
            if !self.buffer.needs_ack(level) || !self.aeads.is_available(level) {
                continue;
            }
            let Some(ack) = self.buffer.take_ack_frame(level) else {
                continue;
            };
            let aead = self.aeads.get(level)?;
            let packet = self.build_packet(level, Payload::single(ack));
            self.transmit(packet, &aead).await?;
        }
        Ok(())
    }

    async fn transmit(&mut self, packet: Packet, aead: &Aead) -> Result<()> {
        self.buffer.on_sent(&packet);
        trace!("Sending {} to {}", packet, self.remote_cid);
        self.sender.send(&packet, aead).await?;
        self.stats.packets_sent += 1;
        Ok(())
    }

    /// Highest level that currently has keys.
    pub fn highest_level(&self) -> EncryptionLevel {
        EncryptionLevel::ALL
            .into_iter()
            .rev()
            .find(|level| self.aeads.is_available(*level))
            .unwrap_or(EncryptionLevel::Initial)
    }

    pub async fn send_close(&mut self, error_code: u64, reason: &str) -> Result<()> {
        let level = self.highest_level();
        debug!("Sending CONNECTION_CLOSE ({}) at {:?} to {}", error_code, level, self.remote_cid);
        self.send_frames(level, vec![Frame::close(error_code, reason)]).await
    }

    pub async fn send_graceful_close(&mut self) -> Result<()> {
        self.send_close(NO_ERROR, "Closing connection").await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.sender.destroy().await
    }

    /// Remove header protection and decrypt with this connection's keys.
    pub fn complete(&self, half: HalfParsedPacket) -> Result<Packet> {
        half.complete(|level| self.aeads.get(level))
    }

    pub fn on_received(&mut self, packet: &Packet) {
        self.stats.packets_received += 1;
        self.buffer.on_received(packet);
    }

    /// Route application frames of a received packet. Returns `true` when
    /// the peer closed the connection.
    pub fn handle_frames(&mut self, packet: &Packet) -> bool {
        let Some(payload) = packet.payload() else {
            return false;
        };
        let mut closed = false;
        for frame in payload.frames() {
            match frame {
                Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => match self.streams.get_or_create(*stream_id, self.listener.clone()) {
                    Ok(stream) => {
                        if let Some(event) = stream.on_data(*offset, data.clone(), *fin) {
                            self.events.push(event);
                        }
                    }
                    Err(e) => warn!("Dropping STREAM frame: {}", e),
                },
                Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_offset,
                } => match self.streams.get_or_create(*stream_id, self.listener.clone()) {
                    Ok(stream) => {
                        if let Some(event) = stream.on_reset(*error_code, *final_offset) {
                            self.events.push(event);
                        }
                    }
                    Err(e) => warn!("Dropping RESET_STREAM frame: {}", e),
                },
                Frame::ConnectionClose {
                    error_code, reason, ..
                } => {
                    debug!(
                        "Peer {} closed connection: code {} reason {:?}",
                        self.remote_cid, error_code, reason
                    );
                    closed = true;
                }
                Frame::Ping | Frame::Padding { .. } | Frame::Ack(_) => {}
                Frame::Crypto { .. } => {
                    trace!("Ignoring CRYPTO frame after handshake");
                }
            }
        }
        closed
    }

    pub fn take_events(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn note_dropped(&mut self) {
        self.stats.packets_dropped += 1;
    }
}

/// First CRYPTO frame of a payload.
pub(crate) fn crypto_data(payload: &Payload) -> std::result::Result<Bytes, ProtocolError> {
    payload
        .frames()
        .iter()
        .find_map(|frame| match frame {
            Frame::Crypto { data, .. } => Some(data.clone()),
            _ => None,
        })
        .ok_or(ProtocolError::MissingFrame("CRYPTO"))
}

/// Deliver listener callbacks, outside of any connection lock.
pub(crate) async fn dispatch_events(events: Vec<StreamEvent>) {
    for event in events {
        event.dispatch().await;
    }
}

/// Listener callbacks of one connection, delivered in order on a task of
/// their own so the receive path never waits on a listener.
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<Vec<StreamEvent>>,
}

impl EventQueue {
    /// Must be called from within a tokio runtime. The task ends once the
    /// queue is dropped and the backlog is delivered.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<StreamEvent>>();
        tokio::spawn(async move {
            while let Some(events) = rx.recv().await {
                dispatch_events(events).await;
            }
        });
        Self { tx }
    }

    pub fn push(&self, events: Vec<StreamEvent>) {
        if events.is_empty() {
            return;
        }
        if self.tx.send(events).is_err() {
            warn!("Event task gone, dropping stream events");
        }
    }
}

/// Whether a receive-side error means "drop the packet" rather than fail.
pub(crate) fn is_droppable(error: &QuicError) -> bool {
    error.is_authentication() || matches!(error, QuicError::Protocol(ProtocolError::MissingAead(_)))
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSender;
    use super::*;
    use crate::crypto::key_schedule::initial_aead;
    use crate::quic::stream::{NoopStreamListener, StreamId, StreamSink};
    use std::sync::Weak;

    struct NullSink;

    #[async_trait]
    impl StreamSink for NullSink {
        async fn write_stream(&self, _: StreamId, _: u64, _: Bytes, _: bool) -> Result<()> {
            Ok(())
        }

        async fn reset_stream(&self, _: StreamId, _: u64, _: u64) -> Result<()> {
            Ok(())
        }
    }

    fn core(sender: Arc<RecordingSender>) -> ConnectionCore {
        let remote = ConnectionId::random();
        let sink: Weak<dyn StreamSink> = Weak::<NullSink>::new();
        ConnectionCore::new(
            ConnectionId::random(),
            remote.clone(),
            Version::CURRENT,
            initial_aead(&remote, true).unwrap(),
            Streams::new(true, sink),
            Arc::new(NoopStreamListener),
            sender,
        )
    }

    #[tokio::test]
    async fn test_packet_numbers_per_level() {
        let sender = Arc::new(RecordingSender::default());
        let mut core = core(sender.clone());
        core.send_frames(EncryptionLevel::Initial, vec![Frame::Ping]).await.unwrap();
        core.send_frames(EncryptionLevel::Initial, vec![Frame::Ping]).await.unwrap();
        assert_eq!(core.next_pn[EncryptionLevel::Initial.index()], PacketNumber::new(2));
        assert_eq!(core.next_pn[EncryptionLevel::Handshake.index()], PacketNumber::MIN);

        assert!(matches!(
            core.send_frames(EncryptionLevel::Handshake, vec![Frame::Ping]).await,
            Err(QuicError::Protocol(ProtocolError::MissingAead(EncryptionLevel::Handshake)))
        ));

        core.reset_initial_space();
        assert_eq!(core.next_pn[EncryptionLevel::Initial.index()], PacketNumber::MIN);
        assert_eq!(sender.packets.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_ack_is_piggybacked() {
        let sender = Arc::new(RecordingSender::default());
        let mut core = core(sender.clone());
        let received = Packet::Initial(InitialPacket {
            version: Version::CURRENT,
            dest_connection_id: core.local_cid.clone(),
            src_connection_id: core.remote_cid.clone(),
            token: Bytes::new(),
            packet_number: PacketNumber::new(0),
            payload: Payload::single(Frame::Ping),
        });
        core.on_received(&received);
        core.send_frames(EncryptionLevel::Initial, vec![Frame::Ping]).await.unwrap();
        core.flush_acks().await.unwrap();

        let packets = sender.packets.lock();
        assert_eq!(packets.len(), 1);
        let frames = packets[0].payload().unwrap().frames();
        assert!(matches!(frames[1], Frame::Ack(_)));
    }

    #[tokio::test]
    async fn test_flush_sends_ack_only_packet() {
        let sender = Arc::new(RecordingSender::default());
        let mut core = core(sender.clone());
        let received = Packet::Initial(InitialPacket {
            version: Version::CURRENT,
            dest_connection_id: core.local_cid.clone(),
            src_connection_id: core.remote_cid.clone(),
            token: Bytes::new(),
            packet_number: PacketNumber::new(3),
            payload: Payload::single(Frame::Ping),
        });
        core.on_received(&received);
        core.flush_acks().await.unwrap();
        core.flush_acks().await.unwrap();

        let packets = sender.packets.lock();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload().unwrap().is_ack_only());
        assert_eq!(core.buffer.unacked_count(), 0);
    }

    #[test]
    fn test_crypto_data_lookup() {
        let payload = Payload::single(Frame::Ping);
        assert_eq!(crypto_data(&payload), Err(ProtocolError::MissingFrame("CRYPTO")));

        let payload = Payload::new(vec![Frame::Ping, Frame::crypto(0, &b"hello"[..])]).unwrap();
        assert_eq!(crypto_data(&payload), Ok(Bytes::from_static(b"hello")));
    }
}
