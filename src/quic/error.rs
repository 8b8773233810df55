use thiserror::Error;

/// Protocol-state violations. These are logged and the offending input is
/// discarded; the connection stays where it was.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing frame: {0}")]
    MissingFrame(&'static str),

    #[error("No AEAD installed for {0:?} level")]
    MissingAead(crate::crypto::EncryptionLevel),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u64),
}

#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("Packet decode error: {0}")]
    Packet(#[from] PacketError),

    #[error("Frame decode error: {0}")]
    Frame(#[from] FrameError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for QuicError {
    fn from(err: config::ConfigError) -> Self {
        QuicError::Config(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too small: {size} bytes")]
    TooSmall { size: usize },

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Unsupported packet type: {0}")]
    UnsupportedType(u8),

    #[error("Invalid connection ID length: {0}")]
    InvalidConnectionIdLength(usize),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Incomplete packet data")]
    IncompleteData,

    #[error("Packet number {0} does not fit in four bytes")]
    PacketNumberTooLarge(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown frame type: {0:#04x}")]
    UnknownType(u64),

    #[error("Truncated frame")]
    Truncated,

    #[error("Varint out of range: {0}")]
    VarintOutOfRange(u64),

    #[error("Invalid ack ranges")]
    InvalidAckRanges,

    #[error("Invalid UTF-8 in reason phrase")]
    InvalidReason,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Header protection failed: {0}")]
    HeaderProtection(String),

    #[error("Key exchange failed")]
    KeyExchange,

    #[error("Signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("Malformed {0} message")]
    Malformed(&'static str),

    #[error("Unexpected handshake message type: {0:#04x}")]
    UnexpectedMessage(u8),

    #[error("Malformed {0} extension")]
    MalformedExtension(&'static str),

    #[error("Missing {0} extension")]
    MissingExtension(&'static str),

    #[error("Unsupported cipher suite or group")]
    Unsupported,

    #[error("Finished verification failed")]
    BadFinished,

    #[error("Handshake message received out of order: {0}")]
    OutOfOrder(&'static str),
}

impl QuicError {
    /// Malformed bytes on the wire.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            QuicError::Packet(_)
                | QuicError::Frame(_)
                | QuicError::Tls(TlsError::Malformed(_))
                | QuicError::Tls(TlsError::MalformedExtension(_))
        )
    }

    /// AEAD open or header protection removal failed. Such packets are
    /// dropped without being acknowledged.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            QuicError::Crypto(CryptoError::Decryption)
                | QuicError::Crypto(CryptoError::HeaderProtection(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;
