use std::sync::Arc;

use super::ClientConnection;
use crate::config::QuicConfig;
use crate::quic::connection::PacketSender;
use crate::quic::connection_id::{ConnectionId, DEFAULT_CONNECTION_ID_LENGTH};
use crate::quic::error::{QuicError, Result};
use crate::quic::stream::{NoopStreamListener, StreamListener};
use crate::quic::version::Version;
use crate::tls::TransportParameters;

pub struct ClientConnectionBuilder {
    version: Version,
    connection_id_length: usize,
    remote_connection_id: Option<ConnectionId>,
    transport_parameters: TransportParameters,
    listener: Arc<dyn StreamListener>,
    sender: Option<Arc<dyn PacketSender>>,
}

impl ClientConnectionBuilder {
    pub fn new() -> Self {
        Self {
            version: Version::CURRENT,
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
            remote_connection_id: None,
            transport_parameters: TransportParameters {
                version: Version::CURRENT,
                ..Default::default()
            },
            listener: Arc::new(NoopStreamListener),
            sender: None,
        }
    }

    /// Take version, connection id length and transport parameters from
    /// a loaded configuration.
    pub fn with_config(mut self, config: &QuicConfig) -> Self {
        self.version = config.client.version();
        self.connection_id_length = config.client.connection_id_length;
        self.transport_parameters = config.transport.to_parameters(self.version, &[]);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self.transport_parameters.version = version;
        self
    }

    pub fn connection_id_length(mut self, len: usize) -> Self {
        self.connection_id_length = len;
        self
    }

    /// Destination id of the first Initial. Random when not set.
    pub fn remote_connection_id(mut self, cid: ConnectionId) -> Self {
        self.remote_connection_id = Some(cid);
        self
    }

    pub fn transport_parameters(mut self, params: TransportParameters) -> Self {
        self.transport_parameters = params;
        self
    }

    /// Listener for streams the server opens.
    pub fn stream_listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn sender(mut self, sender: Arc<dyn PacketSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn build(self) -> Result<ClientConnection> {
        let sender = self
            .sender
            .ok_or_else(|| QuicError::Config("client connection needs a packet sender".into()))?;
        if self.connection_id_length > crate::quic::connection_id::MAX_CONNECTION_ID_LENGTH {
            return Err(QuicError::Config(format!(
                "connection id length {} too large",
                self.connection_id_length
            )));
        }
        let remote = self
            .remote_connection_id
            .unwrap_or_else(|| ConnectionId::random_with_len(self.connection_id_length));
        ClientConnection::new(
            self.version,
            ConnectionId::random_with_len(self.connection_id_length),
            remote,
            self.transport_parameters,
            self.listener,
            sender,
        )
    }
}

impl Default for ClientConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
