//! TLS extensions used by the QUIC handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::transport_parameters::TransportParameters;
use super::Role;
use crate::quic::error::TlsError;

pub const SUPPORTED_GROUPS: u16 = 0x000a;
pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const SUPPORTED_VERSIONS: u16 = 0x002b;
pub const KEY_SHARE: u16 = 0x0033;
pub const QUIC_TRANSPORT_PARAMETERS: u16 = 0x0ff5;

pub const GROUP_X25519: u16 = 0x001d;
pub const TLS13: u16 = 0x0304;
pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: u16,
    pub key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Client offers a list; the server answers with exactly one entry.
    KeyShare(Vec<KeyShareEntry>),
    SupportedVersions(Vec<u16>),
    SupportedGroups(Vec<u16>),
    SignatureAlgorithms(Vec<u16>),
    TransportParameters(TransportParameters),
    Raw { extension_type: u16, data: Bytes },
}

impl Extension {
    pub fn extension_type(&self) -> u16 {
        match self {
            Extension::KeyShare(_) => KEY_SHARE,
            Extension::SupportedVersions(_) => SUPPORTED_VERSIONS,
            Extension::SupportedGroups(_) => SUPPORTED_GROUPS,
            Extension::SignatureAlgorithms(_) => SIGNATURE_ALGORITHMS,
            Extension::TransportParameters(_) => QUIC_TRANSPORT_PARAMETERS,
            Extension::Raw { extension_type, .. } => *extension_type,
        }
    }

    /// Parse a 16-bit length-prefixed extension block written by `role`.
    pub fn parse_all<B: Buf>(buf: &mut B, role: Role) -> Result<Vec<Self>, TlsError> {
        let mut block = read_vec16(buf, "extensions")?;
        let mut extensions = Vec::new();
        while block.has_remaining() {
            extensions.push(Extension::parse(&mut block, role)?);
        }
        Ok(extensions)
    }

    fn parse(buf: &mut Bytes, role: Role) -> Result<Self, TlsError> {
        if buf.remaining() < 2 {
            return Err(TlsError::MalformedExtension("header"));
        }
        let extension_type = buf.get_u16();
        let mut data = read_vec16(buf, "extension body")?;

        let extension = match extension_type {
            KEY_SHARE => {
                let mut entries = Vec::new();
                let mut list = if role == Role::Client {
                    read_vec16(&mut data, "key_share")?
                } else {
                    std::mem::take(&mut data)
                };
                while list.has_remaining() {
                    if list.remaining() < 2 {
                        return Err(TlsError::MalformedExtension("key_share"));
                    }
                    let group = list.get_u16();
                    let key = read_vec16(&mut list, "key_share")?;
                    entries.push(KeyShareEntry { group, key });
                }
                Extension::KeyShare(entries)
            }
            SUPPORTED_VERSIONS => {
                if role == Role::Client {
                    if !data.has_remaining() {
                        return Err(TlsError::MalformedExtension("supported_versions"));
                    }
                    let len = data.get_u8() as usize;
                    let mut list = read_exact(&mut data, len, "supported_versions")?;
                    Extension::SupportedVersions(read_u16_list(&mut list, "supported_versions")?)
                } else {
                    Extension::SupportedVersions(read_u16_list(&mut data, "supported_versions")?)
                }
            }
            SUPPORTED_GROUPS => {
                let mut list = read_vec16(&mut data, "supported_groups")?;
                Extension::SupportedGroups(read_u16_list(&mut list, "supported_groups")?)
            }
            SIGNATURE_ALGORITHMS => {
                let mut list = read_vec16(&mut data, "signature_algorithms")?;
                Extension::SignatureAlgorithms(read_u16_list(&mut list, "signature_algorithms")?)
            }
            QUIC_TRANSPORT_PARAMETERS => {
                Extension::TransportParameters(TransportParameters::parse(&mut data, role)?)
            }
            _ => Extension::Raw {
                extension_type,
                data: std::mem::take(&mut data),
            },
        };
        if data.has_remaining() {
            return Err(TlsError::MalformedExtension("trailing bytes"));
        }
        Ok(extension)
    }

    pub fn write_all<B: BufMut>(extensions: &[Extension], buf: &mut B, role: Role) -> Result<(), TlsError> {
        let mut block = BytesMut::new();
        for extension in extensions {
            let mut body = BytesMut::new();
            extension.write_body(&mut body, role)?;
            block.put_u16(extension.extension_type());
            block.put_u16(body.len() as u16);
            block.put_slice(&body);
        }
        buf.put_u16(block.len() as u16);
        buf.put_slice(&block);
        Ok(())
    }

    fn write_body(&self, buf: &mut BytesMut, role: Role) -> Result<(), TlsError> {
        match self {
            Extension::KeyShare(entries) => {
                let mut list = BytesMut::new();
                for entry in entries {
                    list.put_u16(entry.group);
                    list.put_u16(entry.key.len() as u16);
                    list.put_slice(&entry.key);
                }
                if role == Role::Client {
                    buf.put_u16(list.len() as u16);
                }
                buf.put_slice(&list);
            }
            Extension::SupportedVersions(versions) => {
                if role == Role::Client {
                    buf.put_u8((versions.len() * 2) as u8);
                }
                versions.iter().for_each(|v| buf.put_u16(*v));
            }
            Extension::SupportedGroups(values) | Extension::SignatureAlgorithms(values) => {
                buf.put_u16((values.len() * 2) as u16);
                values.iter().for_each(|v| buf.put_u16(*v));
            }
            Extension::TransportParameters(params) => params.write(buf, role)?,
            Extension::Raw { data, .. } => buf.put_slice(data),
        }
        Ok(())
    }
}

/// Find the first extension matching `pick`.
pub fn find<'a, T>(
    extensions: &'a [Extension],
    pick: impl Fn(&'a Extension) -> Option<T>,
) -> Option<T> {
    extensions.iter().find_map(pick)
}

pub(crate) fn read_exact<B: Buf>(buf: &mut B, len: usize, what: &'static str) -> Result<Bytes, TlsError> {
    if buf.remaining() < len {
        return Err(TlsError::MalformedExtension(what));
    }
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn read_vec16<B: Buf>(buf: &mut B, what: &'static str) -> Result<Bytes, TlsError> {
    if buf.remaining() < 2 {
        return Err(TlsError::MalformedExtension(what));
    }
    let len = buf.get_u16() as usize;
    read_exact(buf, len, what)
}

fn read_u16_list(buf: &mut Bytes, what: &'static str) -> Result<Vec<u16>, TlsError> {
    if buf.remaining() % 2 != 0 {
        return Err(TlsError::MalformedExtension(what));
    }
    let mut values = Vec::with_capacity(buf.remaining() / 2);
    while buf.has_remaining() {
        values.push(buf.get_u16());
    }
    Ok(values)
}
