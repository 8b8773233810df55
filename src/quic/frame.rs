use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::FrameError;
use super::packet::PacketNumber;
use super::stream::StreamId;
use super::varint;

/// QUIC frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Ack = 0x02,
    ResetStream = 0x04,
    Crypto = 0x06,
    Stream = 0x08,
    ConnectionClose = 0x1c,
    ApplicationClose = 0x1d,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x02 => Some(FrameType::Ack),
            0x04 => Some(FrameType::ResetStream),
            0x06 => Some(FrameType::Crypto),
            0x08..=0x0f => Some(FrameType::Stream),
            0x1c => Some(FrameType::ConnectionClose),
            0x1d => Some(FrameType::ApplicationClose),
            _ => None,
        }
    }
}

const STREAM_FIN: u8 = 0x01;
const STREAM_LEN: u8 = 0x02;
const STREAM_OFF: u8 = 0x04;

/// Error code carried by a graceful close
pub const NO_ERROR: u64 = 0x00;

/// Inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckBlock {
    pub smallest: PacketNumber,
    pub largest: PacketNumber,
}

impl AckBlock {
    pub fn new(smallest: PacketNumber, largest: PacketNumber) -> Result<Self, FrameError> {
        if smallest > largest {
            return Err(FrameError::InvalidAckRanges);
        }
        Ok(Self { smallest, largest })
    }

    pub fn single(pn: PacketNumber) -> Self {
        Self {
            smallest: pn,
            largest: pn,
        }
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        self.smallest <= pn && pn <= self.largest
    }

    /// Packet numbers covered by this block
    pub fn packet_numbers(&self) -> impl Iterator<Item = PacketNumber> {
        (self.smallest.value()..=self.largest.value()).map(PacketNumber::new)
    }
}

/// ACK frame: ascending, disjoint, non-adjacent blocks plus the ack delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    delay: u64,
    blocks: Vec<AckBlock>,
}

impl AckFrame {
    /// Blocks must be ascending with at least one packet number between
    /// neighbours, which is what the gap encoding can express.
    pub fn new(delay: u64, blocks: Vec<AckBlock>) -> Result<Self, FrameError> {
        if blocks.is_empty() {
            return Err(FrameError::InvalidAckRanges);
        }
        for pair in blocks.windows(2) {
            if pair[1].smallest.value() < pair[0].largest.value() + 2 {
                return Err(FrameError::InvalidAckRanges);
            }
        }
        Ok(Self { delay, blocks })
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    pub fn blocks(&self) -> &[AckBlock] {
        &self.blocks
    }

    pub fn largest(&self) -> PacketNumber {
        // non-empty by construction
        self.blocks[self.blocks.len() - 1].largest
    }

    pub fn acknowledges(&self, pn: PacketNumber) -> bool {
        self.blocks.iter().any(|b| b.contains(pn))
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), FrameError> {
        let mut descending = self.blocks.iter().rev();
        let first = descending.next().ok_or(FrameError::InvalidAckRanges)?;

        buf.put_u8(FrameType::Ack as u8);
        varint::write(buf, first.largest.value())?;
        varint::write(buf, self.delay)?;
        varint::write(buf, (self.blocks.len() - 1) as u64)?;
        varint::write(buf, first.largest.value() - first.smallest.value())?;

        let mut previous_smallest = first.smallest.value();
        for block in descending {
            let gap = previous_smallest - block.largest.value() - 2;
            varint::write(buf, gap)?;
            varint::write(buf, block.largest.value() - block.smallest.value())?;
            previous_smallest = block.smallest.value();
        }
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let largest = varint::read(buf)?;
        let delay = varint::read(buf)?;
        let extra_blocks = varint::read(buf)?;
        let first_range = varint::read(buf)?;

        let smallest = largest
            .checked_sub(first_range)
            .ok_or(FrameError::InvalidAckRanges)?;
        let mut blocks = vec![AckBlock {
            smallest: PacketNumber::new(smallest),
            largest: PacketNumber::new(largest),
        }];

        let mut previous_smallest = smallest;
        for _ in 0..extra_blocks {
            let gap = varint::read(buf)?;
            let range = varint::read(buf)?;
            let block_largest = previous_smallest
                .checked_sub(gap + 2)
                .ok_or(FrameError::InvalidAckRanges)?;
            let block_smallest = block_largest
                .checked_sub(range)
                .ok_or(FrameError::InvalidAckRanges)?;
            blocks.push(AckBlock {
                smallest: PacketNumber::new(block_smallest),
                largest: PacketNumber::new(block_largest),
            });
            previous_smallest = block_smallest;
        }

        blocks.reverse();
        Ok(Self { delay, blocks })
    }
}

/// QUIC frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A run of `length` zero bytes
    Padding {
        length: usize,
    },
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_offset: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    Stream {
        stream_id: StreamId,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    /// `frame_type` is present for transport closes and absent for
    /// application closes.
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
    },
}

impl Frame {
    pub fn crypto(offset: u64, data: impl Into<Bytes>) -> Self {
        Frame::Crypto {
            offset,
            data: data.into(),
        }
    }

    pub fn close(error_code: u64, reason: impl Into<String>) -> Self {
        Frame::ConnectionClose {
            error_code,
            frame_type: Some(0),
            reason: reason.into(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding { .. } => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack(_) => FrameType::Ack,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::ConnectionClose { frame_type: Some(_), .. } => FrameType::ConnectionClose,
            Frame::ConnectionClose { frame_type: None, .. } => FrameType::ApplicationClose,
        }
    }

    /// Whether receiving this frame obliges the peer to acknowledge.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding { .. })
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encoded_len(&self) -> Result<usize, FrameError> {
        Ok(self.encode()?.len())
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), FrameError> {
        match self {
            Frame::Padding { length } => buf.put_bytes(0, *length),
            Frame::Ping => buf.put_u8(FrameType::Ping as u8),
            Frame::Ack(ack) => ack.write(buf)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                buf.put_u8(FrameType::ResetStream as u8);
                varint::write(buf, stream_id.value())?;
                varint::write(buf, *error_code)?;
                varint::write(buf, *final_offset)?;
            }
            Frame::Crypto { offset, data } => {
                buf.put_u8(FrameType::Crypto as u8);
                varint::write(buf, *offset)?;
                varint::write(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                let mut frame_type = FrameType::Stream as u8 | STREAM_LEN;
                if *offset > 0 {
                    frame_type |= STREAM_OFF;
                }
                if *fin {
                    frame_type |= STREAM_FIN;
                }
                buf.put_u8(frame_type);
                varint::write(buf, stream_id.value())?;
                if *offset > 0 {
                    varint::write(buf, *offset)?;
                }
                varint::write(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                match frame_type {
                    Some(_) => buf.put_u8(FrameType::ConnectionClose as u8),
                    None => buf.put_u8(FrameType::ApplicationClose as u8),
                }
                varint::write(buf, *error_code)?;
                if let Some(frame_type) = frame_type {
                    varint::write(buf, *frame_type)?;
                }
                varint::write(buf, reason.len() as u64)?;
                buf.put_slice(reason.as_bytes());
            }
        }
        Ok(())
    }

    /// Decode a single frame, advancing `buf` past it.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        if !buf.has_remaining() {
            return Err(FrameError::Truncated);
        }
        let type_byte = buf.get_u8();
        let frame_type =
            FrameType::from_byte(type_byte).ok_or(FrameError::UnknownType(type_byte as u64))?;

        let frame = match frame_type {
            FrameType::Padding => {
                let mut length = 1;
                while buf.has_remaining() && buf.chunk()[0] == 0 {
                    buf.advance(1);
                    length += 1;
                }
                Frame::Padding { length }
            }
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => Frame::Ack(AckFrame::read(buf)?),
            FrameType::ResetStream => Frame::ResetStream {
                stream_id: StreamId::new(varint::read(buf)?),
                error_code: varint::read(buf)?,
                final_offset: varint::read(buf)?,
            },
            FrameType::Crypto => {
                let offset = varint::read(buf)?;
                let len = varint::read(buf)? as usize;
                Frame::Crypto {
                    offset,
                    data: read_bytes(buf, len)?,
                }
            }
            FrameType::Stream => {
                let stream_id = StreamId::new(varint::read(buf)?);
                let offset = if type_byte & STREAM_OFF != 0 {
                    varint::read(buf)?
                } else {
                    0
                };
                let len = if type_byte & STREAM_LEN != 0 {
                    varint::read(buf)? as usize
                } else {
                    buf.remaining()
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    fin: type_byte & STREAM_FIN != 0,
                    data: read_bytes(buf, len)?,
                }
            }
            FrameType::ConnectionClose | FrameType::ApplicationClose => {
                let error_code = varint::read(buf)?;
                let frame_type = if frame_type == FrameType::ConnectionClose {
                    Some(varint::read(buf)?)
                } else {
                    None
                };
                let len = varint::read(buf)? as usize;
                let reason = String::from_utf8(read_bytes(buf, len)?.to_vec())
                    .map_err(|_| FrameError::InvalidReason)?;
                Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                }
            }
        };
        Ok(frame)
    }

    /// Decode frames until `buf` is exhausted. Any trailing bytes that do not
    /// form a frame fail the whole sequence.
    pub fn decode_all<B: Buf>(buf: &mut B) -> Result<Vec<Self>, FrameError> {
        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::decode(buf)?);
        }
        Ok(frames)
    }
}

fn read_bytes<B: Buf>(buf: &mut B, len: usize) -> Result<Bytes, FrameError> {
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::new(value)
    }

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode().unwrap();
        let mut buf = encoded.clone();
        let decoded = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded, frame, "encoded as {}", hex::encode(&encoded));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ack_literal_encoding() {
        let ack = AckFrame::new(1234, vec![AckBlock::single(pn(100))]).unwrap();
        let encoded = Frame::Ack(ack).encode().unwrap();
        assert_eq!(hex::encode(&encoded), "02406444d20000");
    }

    #[test]
    fn test_ack_multiple_blocks_preserve_order() {
        let blocks = vec![
            AckBlock::new(pn(1), pn(3)).unwrap(),
            AckBlock::single(pn(5)),
            AckBlock::new(pn(10), pn(12)).unwrap(),
        ];
        let ack = AckFrame::new(7, blocks.clone()).unwrap();
        assert_eq!(ack.largest(), pn(12));

        let mut buf = Frame::Ack(ack).encode().unwrap();
        match Frame::decode(&mut buf).unwrap() {
            Frame::Ack(decoded) => {
                assert_eq!(decoded.blocks(), &blocks[..]);
                assert_eq!(decoded.delay(), 7);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_ack_rejects_adjacent_or_unordered_blocks() {
        assert!(AckFrame::new(0, vec![]).is_err());
        assert!(AckFrame::new(0, vec![AckBlock::single(pn(1)), AckBlock::single(pn(2))]).is_err());
        assert!(AckFrame::new(0, vec![AckBlock::single(pn(5)), AckBlock::single(pn(1))]).is_err());
        assert!(AckBlock::new(pn(4), pn(3)).is_err());
    }

    #[test]
    fn test_frame_roundtrips() {
        roundtrip(Frame::Padding { length: 1 });
        roundtrip(Frame::Padding { length: 37 });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Ack(AckFrame::new(0, vec![AckBlock::single(pn(0))]).unwrap()));
        roundtrip(Frame::ResetStream {
            stream_id: StreamId::new(4),
            error_code: 123,
            final_offset: 456,
        });
        roundtrip(Frame::crypto(0, Bytes::new()));
        roundtrip(Frame::crypto(1000, vec![1u8, 2, 3]));
        roundtrip(Frame::Stream {
            stream_id: StreamId::new(0),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"hello"),
        });
        roundtrip(Frame::Stream {
            stream_id: StreamId::new(9),
            offset: 70_000,
            fin: true,
            data: Bytes::new(),
        });
        roundtrip(Frame::close(NO_ERROR, "Closing connection"));
        roundtrip(Frame::ConnectionClose {
            error_code: 12,
            frame_type: None,
            reason: String::new(),
        });
    }

    #[test]
    fn test_stream_without_length_runs_to_end() {
        let mut buf: &[u8] = &[0x09, 0x04, b'a', b'b'];
        let frame = Frame::decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::Stream {
                stream_id: StreamId::new(4),
                offset: 0,
                fin: true,
                data: Bytes::from_static(b"ab"),
            }
        );
    }

    #[test]
    fn test_unknown_type_and_trailing_garbage() {
        let mut unknown: &[u8] = &[0x3f];
        assert_eq!(Frame::decode(&mut unknown), Err(FrameError::UnknownType(0x3f)));

        let mut truncated: &[u8] = &[0x01, 0x06, 0x00, 0x05, 0xaa];
        assert_eq!(Frame::decode_all(&mut truncated), Err(FrameError::Truncated));
    }

    #[test]
    fn test_padding_collapses_run() {
        let mut buf: &[u8] = &[0x01, 0x00, 0x00, 0x00];
        let frames = Frame::decode_all(&mut buf).unwrap();
        assert_eq!(frames, vec![Frame::Ping, Frame::Padding { length: 3 }]);
        assert!(!frames[1].is_ack_eliciting());
        assert!(frames[0].is_ack_eliciting());
    }
}
