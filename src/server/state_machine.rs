//! Server handshake and packet handling.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crypto::aead::Aead;
use crate::crypto::EncryptionLevel;
use crate::quic::connection::{crypto_data, ConnectionCore};
use crate::quic::error::Result;
use crate::quic::frame::Frame;
use crate::quic::packet::{HandshakePacket, InitialPacket, Packet};
use crate::tls::ServerTlsSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    BeforeInitial,
    WaitingForFinished,
    Ready,
    Closing,
    Closed,
}

impl ServerState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ServerState::Closing | ServerState::Closed)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct ServerStateMachine {
    state: ServerState,
    pub core: ConnectionCore,
    tls: ServerTlsSession,
    /// 1-RTT keys held back until the client Finished verifies
    pending_one_rtt: Option<Aead>,
    state_tx: watch::Sender<ServerState>,
}

impl ServerStateMachine {
    pub fn new(core: ConnectionCore, tls: ServerTlsSession, state_tx: watch::Sender<ServerState>) -> Self {
        Self {
            state: ServerState::BeforeInitial,
            core,
            tls,
            pending_one_rtt: None,
            state_tx,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn transition(&mut self, to: ServerState) {
        if self.state == to {
            return;
        }
        info!("Server {}: {} -> {}", self.core.local_cid, self.state, to);
        self.state = to;
        self.state_tx.send_replace(to);
    }

    pub async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        // The first Initial creates the connection and is not acked
        if self.state != ServerState::BeforeInitial && packet.is_full() {
            self.core.on_received(&packet);
        }

        match (self.state, &packet) {
            (ServerState::BeforeInitial, Packet::Initial(initial)) => {
                self.on_client_hello(initial).await?
            }
            (ServerState::WaitingForFinished, Packet::Handshake(handshake)) => {
                self.on_client_finished(handshake).await?
            }
            (ServerState::Ready | ServerState::Closing | ServerState::Closed, packet)
                if packet.is_full() =>
            {
                if self.core.handle_frames(packet) {
                    self.on_peer_close().await?;
                }
            }
            (state, packet) if packet.payload().is_some_and(|p| p.is_ack_only()) => {
                debug!("Server {}: ack-only {} in state {}", self.core.local_cid, packet, state);
            }
            (state, packet) => {
                warn!("Server {}: discarding {} in state {}", self.core.local_cid, packet, state);
            }
        }

        if !self.state.is_closed() {
            self.core.flush_acks().await?;
        }
        Ok(())
    }

    async fn on_client_hello(&mut self, initial: &InitialPacket) -> Result<()> {
        self.core.remote_cid = initial.src_connection_id.clone();

        let data = match crypto_data(&initial.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Server {}: Initial without ClientHello: {}", self.core.local_cid, e);
                return Ok(());
            }
        };
        let flight = match self.tls.handle_client_hello(&data) {
            Ok(flight) => flight,
            Err(e) => {
                warn!("Server {}: rejecting ClientHello: {}", self.core.local_cid, e);
                return Ok(());
            }
        };
        if let Some(params) = &flight.client_transport_parameters {
            debug!("Client transport parameters: {:?}", params);
        }

        self.core
            .send_frames(EncryptionLevel::Initial, vec![Frame::crypto(0, flight.server_hello)])
            .await?;
        self.core.aeads.set_handshake(flight.handshake_aead);
        self.core
            .send_frames(
                EncryptionLevel::Handshake,
                vec![Frame::crypto(0, flight.server_handshake)],
            )
            .await?;
        self.pending_one_rtt = Some(flight.one_rtt_aead);
        self.transition(ServerState::WaitingForFinished);
        Ok(())
    }

    async fn on_client_finished(&mut self, handshake: &HandshakePacket) -> Result<()> {
        for frame in handshake.payload.frames() {
            let Frame::Crypto { data, .. } = frame else {
                continue;
            };
            match self.tls.handle_client_finished(data) {
                Ok(true) => {
                    if let Some(aead) = self.pending_one_rtt.take() {
                        self.core.aeads.set_one_rtt(aead);
                    }
                    self.transition(ServerState::Ready);
                    return Ok(());
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!("Server {}: client Finished rejected: {}", self.core.local_cid, e);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn on_peer_close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.transition(ServerState::Closing);
        self.core.destroy().await?;
        self.transition(ServerState::Closed);
        Ok(())
    }

    /// Local close. Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            ServerState::Closing | ServerState::Closed => return Ok(()),
            ServerState::BeforeInitial => {}
            _ => {
                if let Err(e) = self.core.send_graceful_close().await {
                    warn!("Server {}: failed to send close: {}", self.core.local_cid, e);
                }
            }
        }
        self.transition(ServerState::Closing);
        self.core.destroy().await?;
        self.transition(ServerState::Closed);
        Ok(())
    }
}
