//! QUIC variable-length integers.
//!
//! The top two bits of the first byte select the encoded width (1/2/4/8
//! bytes); the remaining bits carry the value, big-endian. Largest
//! representable value is 2^62 - 1.

use bytes::{BufMut, BytesMut};

/// Largest value a varint can carry.
pub const MAX: u64 = (1 << 62) - 1;

/// Number of bytes `v` occupies when encoded.
pub fn len(v: u64) -> usize {
    if v < 1 << 6 {
        1
    } else if v < 1 << 14 {
        2
    } else if v < 1 << 30 {
        4
    } else {
        8
    }
}

/// Width of the varint starting with `first`, peeked without consuming.
pub fn size_from_first_byte(first: u8) -> usize {
    1 << (first >> 6)
}

/// Append the encoding of `v` to `out`. Returns the number of bytes written.
pub fn encode(v: u64, out: &mut BytesMut) -> usize {
    match len(v) {
        1 => out.put_u8(v as u8),
        2 => out.put_u16(v as u16 | 0x4000),
        4 => out.put_u32(v as u32 | 0x8000_0000),
        _ => out.put_u64((v & MAX) | 0xc000_0000_0000_0000),
    }
    len(v)
}

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// does not yet hold the whole encoding.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let size = size_from_first_byte(first);
    if buf.len() < size {
        return None;
    }
    let mut v = u64::from(first & 0x3f);
    for b in &buf[1..size] {
        v = (v << 8) | u64::from(*b);
    }
    Some((v, size))
}
