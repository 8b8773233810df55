use bytes::Bytes;
use std::sync::Arc;

use super::connections::Connections;
use super::handler::EchoHandler;
use super::router::PacketRouter;
use super::{QuicServer, ServerContext};
use crate::config::QuicConfig;
use crate::quic::connection_id::{DEFAULT_CONNECTION_ID_LENGTH, MAX_CONNECTION_ID_LENGTH};
use crate::quic::error::{QuicError, Result};
use crate::quic::stream::StreamListener;
use crate::quic::version::{supported_versions, Version};
use crate::tls::TransportParameters;

pub struct QuicServerBuilder {
    certificates: Vec<Bytes>,
    private_key: Option<Bytes>,
    transport_parameters: TransportParameters,
    connection_id_length: usize,
    handler: Option<Arc<dyn StreamListener>>,
}

impl QuicServerBuilder {
    pub fn new() -> Self {
        Self {
            certificates: Vec::new(),
            private_key: None,
            transport_parameters: TransportParameters {
                version: Version::CURRENT,
                supported_versions: supported_versions().to_vec(),
                ..Default::default()
            },
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
            handler: None,
        }
    }

    pub fn with_config(mut self, config: &QuicConfig) -> Self {
        self.connection_id_length = config.server.connection_id_length;
        self.transport_parameters = config
            .transport
            .to_parameters(Version::CURRENT, supported_versions());
        self
    }

    /// DER certificate chain and PKCS#8 ECDSA P-256 key.
    pub fn with_certificate(mut self, certificates: Vec<Bytes>, private_key: Bytes) -> Self {
        self.certificates = certificates;
        self.private_key = Some(private_key);
        self
    }

    /// Generate a throwaway self-signed certificate for `names`.
    pub fn with_self_signed_cert(self, names: Vec<String>) -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|e| QuicError::Config(format!("certificate generation failed: {}", e)))?;
        let der = cert
            .serialize_der()
            .map_err(|e| QuicError::Config(format!("certificate encoding failed: {}", e)))?;
        let key = cert.serialize_private_key_der();
        Ok(self.with_certificate(vec![Bytes::from(der)], Bytes::from(key)))
    }

    pub fn transport_parameters(mut self, params: TransportParameters) -> Self {
        self.transport_parameters = params;
        self
    }

    pub fn connection_id_length(mut self, len: usize) -> Self {
        self.connection_id_length = len;
        self
    }

    /// Listener for client-opened streams. Defaults to echoing.
    pub fn with_handler(mut self, handler: Arc<dyn StreamListener>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<QuicServer> {
        let private_key = self
            .private_key
            .ok_or_else(|| QuicError::Config("server needs a certificate and key".into()))?;
        if self.connection_id_length > MAX_CONNECTION_ID_LENGTH {
            return Err(QuicError::Config(format!(
                "connection id length {} too large",
                self.connection_id_length
            )));
        }
        let context = ServerContext {
            certificates: self.certificates,
            private_key,
            transport_parameters: self.transport_parameters,
        };
        // fail on a bad key now rather than on the first ClientHello
        crate::tls::ServerTlsSession::new(
            context.certificates.clone(),
            &context.private_key,
            context.transport_parameters.clone(),
        )?;

        let handler = self.handler.unwrap_or_else(|| Arc::new(EchoHandler));
        let router = PacketRouter::new(Arc::new(Connections::new(Arc::new(context))), handler)
            .with_connection_id_length(self.connection_id_length);
        Ok(QuicServer::new(router))
    }
}

impl Default for QuicServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
