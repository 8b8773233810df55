//! Variable-length integer encoding.
//!
//! The two most significant bits of the first byte give the encoded length
//! (1, 2, 4 or 8 bytes); the remaining bits carry the value big-endian.

use bytes::{Buf, BufMut};

use super::error::FrameError;

/// Largest encodable value (2^62 - 1).
pub const MAX: u64 = (1u64 << 62) - 1;

/// Number of bytes `value` takes with the shortest encoding.
pub fn encoded_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Write `value` using the shortest encoding.
pub fn write<B: BufMut>(buf: &mut B, value: u64) -> Result<(), FrameError> {
    write_with_len(buf, value, encoded_len(value))
}

/// Write `value` with an explicit encoded length. Used where the length of a
/// field must be known before its value, such as the long header Length.
pub fn write_with_len<B: BufMut>(buf: &mut B, value: u64, len: usize) -> Result<(), FrameError> {
    if value > MAX || encoded_len(value) > len {
        return Err(FrameError::VarintOutOfRange(value));
    }
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        8 => buf.put_u64(0xc000_0000_0000_0000 | value),
        _ => return Err(FrameError::VarintOutOfRange(value)),
    }
    Ok(())
}

pub fn read<B: Buf>(buf: &mut B) -> Result<u64, FrameError> {
    if !buf.has_remaining() {
        return Err(FrameError::Truncated);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_known_encodings() {
        let cases: &[(u64, &str)] = &[
            (37, "25"),
            (15293, "7bbd"),
            (494_878_333, "9d7f3e7d"),
            (151_288_809_941_952_652, "c2197c5eff14e88c"),
        ];
        for (value, hex) in cases {
            let mut buf = BytesMut::new();
            write(&mut buf, *value).unwrap();
            assert_eq!(hex::encode(&buf), *hex);
            let mut read_buf = &buf[..];
            assert_eq!(read(&mut read_buf).unwrap(), *value);
            assert!(read_buf.is_empty());
        }
    }

    #[test]
    fn test_fixed_length() {
        let mut buf = BytesMut::new();
        write_with_len(&mut buf, 100, 2).unwrap();
        assert_eq!(&buf[..], &[0x40, 0x64]);
        assert!(write_with_len(&mut buf, 20_000, 2).is_err());
    }

    #[test]
    fn test_out_of_range_and_truncated() {
        let mut buf = BytesMut::new();
        assert_eq!(write(&mut buf, MAX + 1), Err(FrameError::VarintOutOfRange(MAX + 1)));
        let mut short: &[u8] = &[0x9d, 0x7f];
        assert_eq!(read(&mut short), Err(FrameError::Truncated));
        let mut empty: &[u8] = &[];
        assert_eq!(read(&mut empty), Err(FrameError::Truncated));
    }
}
