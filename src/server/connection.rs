//! Server side of a single QUIC connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::state_machine::{ServerState, ServerStateMachine};
use super::ServerContext;
use crate::crypto::EncryptionLevel;
use crate::quic::connection::{is_droppable, ConnectionCore, ConnectionStats, EventQueue, PacketSender};
use crate::quic::connection_id::ConnectionId;
use crate::quic::error::{QuicError, Result};
use crate::quic::frame::Frame;
use crate::quic::packet::{HalfParsedPacket, Packet};
use crate::quic::stream::{Stream, StreamId, StreamListener, StreamSink, Streams};
use crate::quic::version::Version;
use crate::tls::ServerTlsSession;

struct ServerShared {
    machine: Mutex<ServerStateMachine>,
    state_rx: watch::Receiver<ServerState>,
    local_cid: ConnectionId,
    events: EventQueue,
}

#[derive(Clone)]
pub struct ServerConnection {
    shared: Arc<ServerShared>,
}

impl ServerConnection {
    /// `local_cid` is the destination id of the client's first Initial,
    /// which also keys the Initial AEAD.
    pub(crate) fn new(
        local_cid: ConnectionId,
        version: Version,
        context: &ServerContext,
        listener: Arc<dyn StreamListener>,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Self> {
        let initial_aead = crate::crypto::initial_aead(&local_cid, false)?;
        let tls = ServerTlsSession::new(
            context.certificates.clone(),
            &context.private_key,
            context.transport_parameters.clone(),
        )?;
        let (state_tx, state_rx) = watch::channel(ServerState::BeforeInitial);
        let events = EventQueue::spawn();

        let shared = Arc::new_cyclic(|weak: &Weak<ServerShared>| {
            let sink: Weak<dyn StreamSink> = weak.clone();
            let core = ConnectionCore::new(
                local_cid.clone(),
                // learnt from the client's first Initial
                ConnectionId::random_with_len(0),
                version,
                initial_aead,
                Streams::new(false, sink),
                listener,
                sender,
            );
            ServerShared {
                machine: Mutex::new(ServerStateMachine::new(core, tls, state_tx)),
                state_rx,
                local_cid,
                events,
            }
        });
        Ok(Self { shared })
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.shared.state_rx.clone()
    }

    pub fn local_connection_id(&self) -> &ConnectionId {
        &self.shared.local_cid
    }

    pub async fn remote_connection_id(&self) -> ConnectionId {
        self.shared.machine.lock().await.core.remote_cid.clone()
    }

    /// Decrypt a routed packet with this connection's keys and process it.
    /// Returns once the packet is handled; listener callbacks it produced
    /// run afterwards on the connection's event task.
    pub async fn on_half_parsed(&self, half: HalfParsedPacket) -> Result<()> {
        let events = {
            let mut machine = self.shared.machine.lock().await;
            let packet = match machine.core.complete(half) {
                Ok(packet) => packet,
                Err(e) if is_droppable(&e) => {
                    debug!("Server {}: dropping packet: {}", self.shared.local_cid, e);
                    machine.core.note_dropped();
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            machine.handle_packet(packet).await?;
            machine.core.take_events()
        };
        self.shared.events.push(events);
        Ok(())
    }

    pub async fn on_packet(&self, packet: Packet) -> Result<()> {
        let events = {
            let mut machine = self.shared.machine.lock().await;
            machine.handle_packet(packet).await?;
            machine.core.take_events()
        };
        self.shared.events.push(events);
        Ok(())
    }

    pub async fn open_stream(&self, listener: Arc<dyn StreamListener>) -> Result<Stream> {
        let mut machine = self.shared.machine.lock().await;
        if machine.state() != ServerState::Ready {
            return Err(QuicError::IllegalState(format!(
                "cannot open a stream in state {}",
                machine.state()
            )));
        }
        Ok(machine.core.streams.open_stream(listener))
    }

    pub async fn close(&self) -> Result<()> {
        self.shared.machine.lock().await.close().await
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.shared.machine.lock().await.core.stats
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("local_cid", &self.shared.local_cid)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerShared {
    async fn send_stream_frame(&self, id: StreamId, frame: Frame) -> Result<()> {
        let mut machine = self.machine.lock().await;
        if machine.state() != ServerState::Ready {
            return Err(QuicError::IllegalState(format!(
                "stream {} unusable in state {}",
                id,
                machine.state()
            )));
        }
        machine.core.send_frames(EncryptionLevel::OneRtt, vec![frame]).await
    }
}

#[async_trait]
impl StreamSink for ServerShared {
    async fn write_stream(&self, id: StreamId, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        self.send_stream_frame(
            id,
            Frame::Stream {
                stream_id: id,
                offset,
                fin,
                data,
            },
        )
        .await
    }

    async fn reset_stream(&self, id: StreamId, error_code: u64, final_offset: u64) -> Result<()> {
        self.send_stream_frame(
            id,
            Frame::ResetStream {
                stream_id: id,
                error_code,
                final_offset,
            },
        )
        .await
    }
}
