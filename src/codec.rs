//! Wire framing for the six MTFTP packet types (spec §6).
//!
//! `decode` borrows from the input buffer and performs no allocation;
//! `encode` writes into a caller-supplied [`bytes::BufMut`]. Neither
//! function touches a filesystem, a socket, or any state outside its
//! arguments — the codec is pure, as required by invariant 3 ("the codec
//! allocates nothing per packet").

use bytes::BufMut;
use thiserror::Error;

const TAG_RRQ: u8 = 0x01;
const TAG_WRQ: u8 = 0x02;
const TAG_DATA: u8 = 0x03;
const TAG_ACK: u8 = 0x04;
const TAG_ERR: u8 = 0x05;
const TAG_END: u8 = 0x06;

/// A decoded packet. `Data`'s payload and `Err`'s message borrow directly
/// from the buffer passed to [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Rrq { file_index: u16, start_block: u16 },
    Wrq { file_index: u16, start_block: u16 },
    Data { block_no: u16, payload: &'a [u8] },
    /// `bitmap` holds up to 64 window bits, bit `i` set iff block
    /// `window_base + i` has been marked present.
    Ack { window_base: u16, bitmap: u64 },
    Err { code: u8, message: &'a [u8] },
    End,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet shorter than 1 byte")]
    TooShort,
    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("RRQ/WRQ length must be 5, got {0}")]
    BadRequestLength(usize),
    #[error("DATA payload length {got} exceeds block_size {block_size}")]
    DataTooLarge { got: usize, block_size: u16 },
    #[error("ACK bitmap length {got} bytes, expected {expected}")]
    BadBitmapLength { got: usize, expected: usize },
}

/// Bytes needed to carry `window_size` bitmap bits, LSB-first within a byte.
pub fn bitmap_bytes(window_size: u16) -> usize {
    (window_size as usize).div_ceil(8)
}

/// Decode a datagram. `block_size` and `window_size` are the locally
/// configured values used to validate DATA and ACK framing (spec §4.1).
pub fn decode(buf: &[u8], block_size: u16, window_size: u16) -> Result<Packet<'_>, CodecError> {
    let (&tag, rest) = buf.split_first().ok_or(CodecError::TooShort)?;
    match tag {
        TAG_RRQ | TAG_WRQ => {
            if buf.len() != 5 {
                return Err(CodecError::BadRequestLength(buf.len()));
            }
            let file_index = u16::from_le_bytes([rest[0], rest[1]]);
            let start_block = u16::from_le_bytes([rest[2], rest[3]]);
            Ok(if tag == TAG_RRQ {
                Packet::Rrq {
                    file_index,
                    start_block,
                }
            } else {
                Packet::Wrq {
                    file_index,
                    start_block,
                }
            })
        }
        TAG_DATA => {
            if rest.len() < 2 {
                return Err(CodecError::TooShort);
            }
            let block_no = u16::from_le_bytes([rest[0], rest[1]]);
            let payload = &rest[2..];
            if payload.len() > block_size as usize {
                return Err(CodecError::DataTooLarge {
                    got: payload.len(),
                    block_size,
                });
            }
            Ok(Packet::Data { block_no, payload })
        }
        TAG_ACK => {
            if rest.len() < 2 {
                return Err(CodecError::TooShort);
            }
            let window_base = u16::from_le_bytes([rest[0], rest[1]]);
            let bitmap_raw = &rest[2..];
            let expected = bitmap_bytes(window_size);
            if bitmap_raw.len() != expected {
                return Err(CodecError::BadBitmapLength {
                    got: bitmap_raw.len(),
                    expected,
                });
            }
            let mut bitmap = 0u64;
            for (i, byte) in bitmap_raw.iter().enumerate() {
                bitmap |= (*byte as u64) << (i * 8);
            }
            Ok(Packet::Ack {
                window_base,
                bitmap,
            })
        }
        TAG_ERR => {
            if rest.is_empty() {
                return Err(CodecError::TooShort);
            }
            let code = rest[0];
            let message = &rest[1..];
            Ok(Packet::Err { code, message })
        }
        TAG_END => {
            if !rest.is_empty() {
                // Extra trailing bytes on an END are tolerated rather than
                // rejected: the opcode alone is unambiguous.
            }
            Ok(Packet::End)
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Encode `packet` into `out`. `window_size` determines the ACK bitmap's
/// wire length; callers must pass the same value used to decode.
pub fn encode(packet: &Packet<'_>, window_size: u16, out: &mut impl BufMut) {
    match *packet {
        Packet::Rrq {
            file_index,
            start_block,
        } => {
            out.put_u8(TAG_RRQ);
            out.put_u16_le(file_index);
            out.put_u16_le(start_block);
        }
        Packet::Wrq {
            file_index,
            start_block,
        } => {
            out.put_u8(TAG_WRQ);
            out.put_u16_le(file_index);
            out.put_u16_le(start_block);
        }
        Packet::Data { block_no, payload } => {
            out.put_u8(TAG_DATA);
            out.put_u16_le(block_no);
            out.put_slice(payload);
        }
        Packet::Ack {
            window_base,
            bitmap,
        } => {
            out.put_u8(TAG_ACK);
            out.put_u16_le(window_base);
            for i in 0..bitmap_bytes(window_size) {
                out.put_u8(((bitmap >> (i * 8)) & 0xff) as u8);
            }
        }
        Packet::Err { code, message } => {
            out.put_u8(TAG_ERR);
            out.put_u8(code);
            out.put_slice(message);
        }
        Packet::End => {
            out.put_u8(TAG_END);
        }
    }
}
