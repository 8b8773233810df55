//! Configuration for clients, servers and the transport parameters they
//! advertise.
//!
//! Files are read through the `config` crate, so TOML, JSON and YAML are
//! all accepted (picked by extension). Environment overrides use the
//! `NQUIC` prefix with `__` between path segments, for example
//! `NQUIC_SERVER__BIND_ADDR=127.0.0.1:4433`.

use crate::quic::connection_id::{DEFAULT_CONNECTION_ID_LENGTH, MAX_CONNECTION_ID_LENGTH};
use crate::quic::error::{QuicError, Result};
use crate::quic::version::Version;
use crate::tls::TransportParameters;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::Level;

/// Main QUIC configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

/// Client-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Protocol version offered in the first Initial
    pub version: u32,
    /// Length of locally generated connection ids
    pub connection_id_length: usize,
}

impl ClientConfig {
    pub fn version(&self) -> Version {
        Version::new(self.version)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: Version::CURRENT.value(),
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
        }
    }
}

/// Server-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Length of the connection ids the server hands out. Short headers
    /// are parsed with it.
    pub connection_id_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4433)),
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
        }
    }
}

/// Values advertised in the transport parameters extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle timeout in seconds
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub disable_migration: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 30,
            max_packet_size: 1452,
            initial_max_data: 1024 * 1024,       // 1MB
            initial_max_stream_data: 256 * 1024, // 256KB
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            disable_migration: true,
        }
    }
}

impl TransportConfig {
    /// Build the parameters for `version`. A server passes the versions it
    /// supports; a client passes an empty list.
    pub fn to_parameters(&self, version: Version, supported: &[Version]) -> TransportParameters {
        TransportParameters {
            version,
            supported_versions: supported.to_vec(),
            idle_timeout: Some(self.idle_timeout),
            max_packet_size: Some(self.max_packet_size),
            initial_max_data: Some(self.initial_max_data),
            initial_max_stream_data_bidi_local: Some(self.initial_max_stream_data),
            initial_max_stream_data_bidi_remote: Some(self.initial_max_stream_data),
            initial_max_stream_data_uni: Some(self.initial_max_stream_data),
            initial_max_streams_bidi: Some(self.initial_max_streams_bidi),
            initial_max_streams_uni: Some(self.initial_max_streams_uni),
            disable_migration: self.disable_migration,
            ..Default::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Colour the terminal output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl QuicConfig {
    /// Load configuration from a TOML, JSON or YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NQUIC_*` environment variables.
    pub fn load_from_env() -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("NQUIC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| QuicError::Config(format!("Failed to serialize to JSON: {}", e)))?;
        std::fs::write(path, contents)
            .map_err(|e| QuicError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (side, len) in [
            ("client", self.client.connection_id_length),
            ("server", self.server.connection_id_length),
        ] {
            if len > MAX_CONNECTION_ID_LENGTH {
                return Err(QuicError::Config(format!(
                    "{} connection_id_length must be at most {}",
                    side, MAX_CONNECTION_ID_LENGTH
                )));
            }
        }
        // the server routes short headers by its own cid, so it cannot be empty
        if self.server.connection_id_length == 0 {
            return Err(QuicError::Config(
                "server connection_id_length must be greater than 0".to_string(),
            ));
        }
        if Version::new(self.client.version).is_negotiation() {
            return Err(QuicError::Config("client version must not be 0".to_string()));
        }
        if self.transport.max_packet_size < 1200 {
            return Err(QuicError::Config(
                "max_packet_size must be at least 1200".to_string(),
            ));
        }
        self.tracing_level()?;
        Ok(())
    }

    pub fn tracing_level(&self) -> Result<Level> {
        self.logging
            .level
            .parse::<Level>()
            .map_err(|_| QuicError::Config(format!("Unknown log level: {}", self.logging.level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.version(), Version::CURRENT);
        assert_eq!(config.tracing_level().unwrap(), Level::INFO);
    }

    #[test]
    fn test_config_validation() {
        let mut config = QuicConfig::default();
        config.server.connection_id_length = 0;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.client.connection_id_length = 21;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_parameters_from_config() {
        let transport = TransportConfig::default();
        let client = transport.to_parameters(Version::CURRENT, &[]);
        assert_eq!(client.version, Version::CURRENT);
        assert!(client.supported_versions.is_empty());
        assert_eq!(client.idle_timeout, Some(30));
        assert!(client.disable_migration);

        let server = transport.to_parameters(Version::CURRENT, &[Version::CURRENT]);
        assert_eq!(server.supported_versions, vec![Version::CURRENT]);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = std::env::temp_dir().join(format!("nquic-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nquic.toml");
        std::fs::write(
            &path,
            "[server]\nbind_addr = \"127.0.0.1:9443\"\n\n[transport]\nidle_timeout = 5\n",
        )
        .unwrap();

        let config = QuicConfig::load_from_file(&path).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9443".parse().unwrap());
        assert_eq!(config.transport.idle_timeout, 5);
        // untouched sections keep their defaults
        assert_eq!(config.client, ClientConfig::default());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_json_save_and_load() {
        let dir = std::env::temp_dir().join(format!("nquic-json-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nquic.json");

        let mut config = QuicConfig::default();
        config.logging.level = "debug".into();
        config.save_to_file(&path).unwrap();
        assert_eq!(QuicConfig::load_from_file(&path).unwrap(), config);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
