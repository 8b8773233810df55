//! Client connections.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub mod builder;
pub mod state_machine;

pub use builder::ClientConnectionBuilder;
pub use state_machine::ClientState;

use crate::crypto::EncryptionLevel;
use crate::quic::connection::{dispatch_events, is_droppable, ConnectionCore, ConnectionStats, PacketSender};
use crate::quic::connection_id::ConnectionId;
use crate::quic::error::{QuicError, Result};
use crate::quic::frame::Frame;
use crate::quic::packet::Packet;
use crate::quic::stream::{Stream, StreamId, StreamListener, StreamSink, Streams};
use crate::quic::version::Version;
use crate::tls::{ClientTlsSession, TransportParameters};
use state_machine::ClientStateMachine;

/// Resolves once the handshake finishes or the connection closes.
#[derive(Debug, Clone)]
pub struct HandshakeHandle {
    state: watch::Receiver<ClientState>,
}

impl HandshakeHandle {
    pub async fn wait(mut self) -> Result<()> {
        let state = self
            .state
            .wait_for(|s| *s == ClientState::Ready || s.is_closed())
            .await
            .map_err(|_| QuicError::ConnectionClosed)?;
        match *state {
            ClientState::Ready => Ok(()),
            _ => Err(QuicError::ConnectionClosed),
        }
    }
}

struct ClientShared {
    machine: Mutex<ClientStateMachine>,
    state_rx: watch::Receiver<ClientState>,
    local_cid: ConnectionId,
}

/// Client side of a QUIC connection.
#[derive(Clone)]
pub struct ClientConnection {
    shared: Arc<ClientShared>,
}

impl ClientConnection {
    pub fn builder() -> ClientConnectionBuilder {
        ClientConnectionBuilder::new()
    }

    pub(crate) fn new(
        version: Version,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        transport_parameters: TransportParameters,
        listener: Arc<dyn StreamListener>,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Self> {
        let initial_aead = crate::crypto::initial_aead(&remote_cid, true)?;
        let (state_tx, state_rx) = watch::channel(ClientState::BeforeInitial);

        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            let sink: Weak<dyn StreamSink> = weak.clone();
            let core = ConnectionCore::new(
                local_cid.clone(),
                remote_cid,
                version,
                initial_aead,
                Streams::new(true, sink),
                listener,
                sender,
            );
            ClientShared {
                machine: Mutex::new(ClientStateMachine::new(
                    core,
                    ClientTlsSession::new(transport_parameters),
                    state_tx,
                )),
                state_rx,
                local_cid,
            }
        });
        Ok(Self { shared })
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state_rx.clone()
    }

    pub fn local_connection_id(&self) -> &ConnectionId {
        &self.shared.local_cid
    }

    pub async fn remote_connection_id(&self) -> ConnectionId {
        self.shared.machine.lock().await.core.remote_cid.clone()
    }

    /// Send the ClientHello. Fails with `IllegalState` unless the
    /// connection is brand new.
    pub async fn handshake(&self) -> Result<HandshakeHandle> {
        self.shared.machine.lock().await.handshake().await?;
        Ok(HandshakeHandle {
            state: self.shared.state_rx.clone(),
        })
    }

    /// Handshake and wait until the connection is ready.
    pub async fn connect(&self) -> Result<()> {
        self.handshake().await?.wait().await
    }

    /// Process one received datagram. Packets that fail authentication
    /// are dropped; malformed ones are reported.
    pub async fn on_datagram(&self, datagram: Bytes) -> Result<()> {
        let half = Packet::parse_header(datagram, self.shared.local_cid.len())?;
        let events = {
            let mut machine = self.shared.machine.lock().await;
            let packet = match machine.core.complete(half) {
                Ok(packet) => packet,
                Err(e) if is_droppable(&e) => {
                    debug!("Client {}: dropping packet: {}", self.shared.local_cid, e);
                    machine.core.note_dropped();
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            machine.handle_packet(packet).await?;
            machine.core.take_events()
        };
        dispatch_events(events).await;
        Ok(())
    }

    /// Process an already decrypted packet.
    pub async fn on_packet(&self, packet: Packet) -> Result<()> {
        let events = {
            let mut machine = self.shared.machine.lock().await;
            machine.handle_packet(packet).await?;
            machine.core.take_events()
        };
        dispatch_events(events).await;
        Ok(())
    }

    pub async fn open_stream(&self, listener: Arc<dyn StreamListener>) -> Result<Stream> {
        let mut machine = self.shared.machine.lock().await;
        if machine.state() != ClientState::Ready {
            return Err(QuicError::IllegalState(format!(
                "cannot open a stream in state {}",
                machine.state()
            )));
        }
        Ok(machine.core.streams.open_stream(listener))
    }

    /// Close with NO_ERROR. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.shared.machine.lock().await.close().await
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.shared.machine.lock().await.core.stats
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("local_cid", &self.shared.local_cid)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl StreamSink for ClientShared {
    async fn write_stream(&self, id: StreamId, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        let mut machine = self.machine.lock().await;
        if machine.state() != ClientState::Ready {
            return Err(QuicError::IllegalState(format!(
                "cannot write to stream {} in state {}",
                id,
                machine.state()
            )));
        }
        machine
            .core
            .send_frames(
                EncryptionLevel::OneRtt,
                vec![Frame::Stream {
                    stream_id: id,
                    offset,
                    fin,
                    data,
                }],
            )
            .await
    }

    async fn reset_stream(&self, id: StreamId, error_code: u64, final_offset: u64) -> Result<()> {
        let mut machine = self.machine.lock().await;
        if machine.state() != ClientState::Ready {
            return Err(QuicError::IllegalState(format!(
                "cannot reset stream {} in state {}",
                id,
                machine.state()
            )));
        }
        machine
            .core
            .send_frames(
                EncryptionLevel::OneRtt,
                vec![Frame::ResetStream {
                    stream_id: id,
                    error_code,
                    final_offset,
                }],
            )
            .await
    }
}
