//! Client handshake and packet handling.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crypto::aead::AeadSet;
use crate::crypto::key_schedule::initial_aead;
use crate::crypto::EncryptionLevel;
use crate::quic::connection::{crypto_data, ConnectionCore};
use crate::quic::error::{QuicError, Result};
use crate::quic::frame::Frame;
use crate::quic::packet::{HandshakePacket, InitialPacket, Packet, RetryPacket, VersionNegotiationPacket};
use crate::tls::ClientTlsSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    BeforeInitial,
    WaitingForServerHello,
    WaitingForHandshake,
    Ready,
    Closing,
    Closed,
}

impl ClientState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientState::Closing | ClientState::Closed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct ClientStateMachine {
    state: ClientState,
    pub core: ConnectionCore,
    tls: ClientTlsSession,
    /// Only one Retry is honoured per connection
    retried: bool,
    state_tx: watch::Sender<ClientState>,
}

impl ClientStateMachine {
    pub fn new(core: ConnectionCore, tls: ClientTlsSession, state_tx: watch::Sender<ClientState>) -> Self {
        Self {
            state: ClientState::BeforeInitial,
            core,
            tls,
            retried: false,
            state_tx,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn transition(&mut self, to: ClientState) {
        if self.state == to {
            return;
        }
        info!(
            "Client {}: {} -> {}",
            self.core.local_cid, self.state, to
        );
        self.state = to;
        self.state_tx.send_replace(to);
    }

    /// Send the first Initial. Only legal before anything else happened.
    pub async fn handshake(&mut self) -> Result<()> {
        if self.state != ClientState::BeforeInitial {
            return Err(QuicError::IllegalState(format!(
                "handshake() called in state {}",
                self.state
            )));
        }
        self.send_client_hello().await?;
        self.transition(ClientState::WaitingForServerHello);
        Ok(())
    }

    async fn send_client_hello(&mut self) -> Result<()> {
        let hello = self.tls.start_handshake()?;
        self.core
            .send_frames(EncryptionLevel::Initial, vec![Frame::crypto(0, hello)])
            .await
    }

    pub async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        if packet.is_full() {
            self.core.on_received(&packet);
        }

        match (self.state, &packet) {
            (ClientState::WaitingForServerHello, Packet::Initial(initial)) => {
                self.on_server_hello(initial).await?
            }
            (ClientState::WaitingForServerHello, Packet::Retry(retry)) => self.on_retry(retry).await?,
            (ClientState::WaitingForServerHello, Packet::VersionNegotiation(vn)) => {
                self.on_version_negotiation(vn).await?
            }
            (ClientState::WaitingForHandshake, Packet::Handshake(handshake)) => {
                self.on_handshake(handshake).await?
            }
            (ClientState::Ready | ClientState::Closing | ClientState::Closed, packet)
                if packet.is_full() =>
            {
                if self.core.handle_frames(packet) {
                    self.on_peer_close().await?;
                }
            }
            (state, packet) if packet.payload().is_some_and(|p| p.is_ack_only()) => {
                debug!("Client {}: ack-only {} in state {}", self.core.local_cid, packet, state);
            }
            (state, packet) => {
                warn!("Client {}: discarding {} in state {}", self.core.local_cid, packet, state);
            }
        }

        if !self.state.is_closed() {
            self.core.flush_acks().await?;
        }
        Ok(())
    }

    async fn on_server_hello(&mut self, initial: &InitialPacket) -> Result<()> {
        // Initial keys stay bound to the original destination id
        self.core.remote_cid = initial.src_connection_id.clone();

        let data = match crypto_data(&initial.payload) {
            Ok(data) => data,
            Err(e) => {
                debug!("Initial without ServerHello: {}", e);
                return Ok(());
            }
        };
        match self.tls.handle_server_hello(&data) {
            Ok(aead) => {
                self.core.aeads.set_handshake(aead);
                self.transition(ClientState::WaitingForHandshake);
            }
            Err(e) => warn!("Client {}: rejecting ServerHello: {}", self.core.local_cid, e),
        }
        Ok(())
    }

    async fn on_retry(&mut self, retry: &RetryPacket) -> Result<()> {
        if retry.original_connection_id != self.core.remote_cid {
            warn!(
                "Retry for {} does not match our destination {}",
                retry.original_connection_id, self.core.remote_cid
            );
            return Ok(());
        }
        if self.retried {
            debug!("Ignoring second Retry");
            return Ok(());
        }
        self.retried = true;

        info!(
            "Client {}: Retry from {}, token {} bytes",
            self.core.local_cid,
            retry.src_connection_id,
            retry.token.len()
        );
        self.core.remote_cid = retry.src_connection_id.clone();
        self.core.aeads = AeadSet::new(initial_aead(&self.core.remote_cid, true)?);
        self.core.reset_initial_space();
        self.core.token = retry.token.clone();
        self.tls.reset();
        self.send_client_hello().await
    }

    async fn on_version_negotiation(&mut self, vn: &VersionNegotiationPacket) -> Result<()> {
        let offered: Vec<String> = vn.supported_versions.iter().map(|v| v.to_string()).collect();
        warn!(
            "Client {}: server offers versions [{}], none usable",
            self.core.local_cid,
            offered.join(", ")
        );
        self.transition(ClientState::Closing);
        self.core.destroy().await?;
        self.transition(ClientState::Closed);
        Ok(())
    }

    async fn on_handshake(&mut self, handshake: &HandshakePacket) -> Result<()> {
        for frame in handshake.payload.frames() {
            let Frame::Crypto { data, .. } = frame else {
                continue;
            };
            let result = match self.tls.handle_handshake(data) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Client {}: handshake data rejected: {}", self.core.local_cid, e);
                    return Ok(());
                }
            };
            self.core.aeads.set_one_rtt(result.one_rtt_aead);
            self.core
                .send_frames(EncryptionLevel::Handshake, vec![Frame::crypto(0, result.fin)])
                .await?;
            self.transition(ClientState::Ready);
            return Ok(());
        }
        Ok(())
    }

    async fn on_peer_close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.transition(ClientState::Closing);
        self.core.destroy().await?;
        self.transition(ClientState::Closed);
        Ok(())
    }

    /// Local close. Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            ClientState::Closing | ClientState::Closed => return Ok(()),
            ClientState::BeforeInitial => {}
            _ => {
                if let Err(e) = self.core.send_graceful_close().await {
                    warn!("Client {}: failed to send close: {}", self.core.local_cid, e);
                }
            }
        }
        self.transition(ClientState::Closing);
        self.core.destroy().await?;
        self.transition(ClientState::Closed);
        Ok(())
    }
}
