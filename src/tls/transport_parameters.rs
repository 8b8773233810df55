//! QUIC transport parameters carried in a TLS extension.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Role;
use crate::quic::error::TlsError;
use crate::quic::varint;
use crate::quic::version::Version;

const ORIGINAL_CONNECTION_ID: u16 = 0x0000;
const IDLE_TIMEOUT: u16 = 0x0001;
const STATELESS_RESET_TOKEN: u16 = 0x0002;
const MAX_PACKET_SIZE: u16 = 0x0003;
const INITIAL_MAX_DATA: u16 = 0x0004;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x0005;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x0006;
const INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x0007;
const INITIAL_MAX_STREAMS_BIDI: u16 = 0x0008;
const INITIAL_MAX_STREAMS_UNI: u16 = 0x0009;
const ACK_DELAY_EXPONENT: u16 = 0x000a;
const MAX_ACK_DELAY: u16 = 0x000b;
const DISABLE_MIGRATION: u16 = 0x000c;

const MALFORMED: TlsError = TlsError::MalformedExtension("transport parameters");

/// Transport parameters. The client form carries the initially offered
/// version; the server form carries the negotiated version and the list of
/// versions the server supports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportParameters {
    pub version: Version,
    pub supported_versions: Vec<Version>,
    pub original_connection_id: Option<Bytes>,
    pub idle_timeout: Option<u64>,
    pub stateless_reset_token: Option<Bytes>,
    pub max_packet_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    pub max_ack_delay: Option<u64>,
    pub disable_migration: bool,
}

impl TransportParameters {
    /// `role` is the endpoint that wrote the parameters.
    pub fn parse<B: Buf>(buf: &mut B, role: Role) -> Result<Self, TlsError> {
        let mut params = TransportParameters::default();

        if buf.remaining() < 4 {
            return Err(MALFORMED);
        }
        params.version = Version::new(buf.get_u32());

        if role == Role::Server {
            if !buf.has_remaining() {
                return Err(MALFORMED);
            }
            let len = buf.get_u8() as usize;
            if len % 4 != 0 || buf.remaining() < len {
                return Err(MALFORMED);
            }
            for _ in 0..len / 4 {
                params.supported_versions.push(Version::new(buf.get_u32()));
            }
        }

        if buf.remaining() < 2 {
            return Err(MALFORMED);
        }
        let total = buf.get_u16() as usize;
        if buf.remaining() < total {
            return Err(MALFORMED);
        }
        let mut list = buf.copy_to_bytes(total);

        while list.has_remaining() {
            if list.remaining() < 4 {
                return Err(MALFORMED);
            }
            let id = list.get_u16();
            let len = list.get_u16() as usize;
            if list.remaining() < len {
                return Err(MALFORMED);
            }
            let mut value = list.copy_to_bytes(len);

            match id {
                ORIGINAL_CONNECTION_ID => params.original_connection_id = Some(value),
                STATELESS_RESET_TOKEN => params.stateless_reset_token = Some(value),
                DISABLE_MIGRATION => params.disable_migration = true,
                IDLE_TIMEOUT => params.idle_timeout = Some(read_int(&mut value)?),
                MAX_PACKET_SIZE => params.max_packet_size = Some(read_int(&mut value)?),
                INITIAL_MAX_DATA => params.initial_max_data = Some(read_int(&mut value)?),
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Some(read_int(&mut value)?)
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Some(read_int(&mut value)?)
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = Some(read_int(&mut value)?)
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = Some(read_int(&mut value)?)
                }
                INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = Some(read_int(&mut value)?)
                }
                ACK_DELAY_EXPONENT => params.ack_delay_exponent = Some(read_int(&mut value)?),
                MAX_ACK_DELAY => params.max_ack_delay = Some(read_int(&mut value)?),
                // unknown parameters are ignored
                _ => {}
            }
        }
        Ok(params)
    }

    pub fn write<B: BufMut>(&self, buf: &mut B, role: Role) -> Result<(), TlsError> {
        buf.put_u32(self.version.value());
        if role == Role::Server {
            buf.put_u8((self.supported_versions.len() * 4) as u8);
            for version in &self.supported_versions {
                buf.put_u32(version.value());
            }
        }

        let mut list = BytesMut::new();
        let ints = [
            (IDLE_TIMEOUT, self.idle_timeout),
            (MAX_PACKET_SIZE, self.max_packet_size),
            (INITIAL_MAX_DATA, self.initial_max_data),
            (INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, self.initial_max_stream_data_bidi_local),
            (INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, self.initial_max_stream_data_bidi_remote),
            (INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni),
            (INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi),
            (INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni),
            (ACK_DELAY_EXPONENT, self.ack_delay_exponent),
            (MAX_ACK_DELAY, self.max_ack_delay),
        ];
        for (id, value) in ints {
            if let Some(value) = value {
                list.put_u16(id);
                list.put_u16(varint::encoded_len(value) as u16);
                varint::write(&mut list, value).map_err(|_| MALFORMED)?;
            }
        }
        if let Some(cid) = &self.original_connection_id {
            write_bytes(&mut list, ORIGINAL_CONNECTION_ID, cid);
        }
        if let Some(token) = &self.stateless_reset_token {
            write_bytes(&mut list, STATELESS_RESET_TOKEN, token);
        }
        if self.disable_migration {
            write_bytes(&mut list, DISABLE_MIGRATION, &[]);
        }

        buf.put_u16(list.len() as u16);
        buf.put_slice(&list);
        Ok(())
    }
}

fn read_int(value: &mut Bytes) -> Result<u64, TlsError> {
    let v = varint::read(value).map_err(|_| MALFORMED)?;
    if value.has_remaining() {
        return Err(MALFORMED);
    }
    Ok(v)
}

fn write_bytes(list: &mut BytesMut, id: u16, value: &[u8]) {
    list.put_u16(id);
    list.put_u16(value.len() as u16);
    list.put_slice(value);
}
