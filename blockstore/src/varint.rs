//! Unsigned variable-length integers as used by multiformats.
//!
//! Each byte carries 7 bits of the value (least significant group first) and a
//! continuation bit. Encodings are limited to [MAX_LEN] bytes and must be minimal.
//!
//! Decoding operates on a borrowed slice that may end at an arbitrary point of a
//! stream, so [read] distinguishes an incomplete value (`Ok(None)`) from an invalid
//! one (`Err`).

use crate::Error;
use bytes::BufMut;

const DATA_BITS_PER_BYTE: u32 = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;

/// Maximum number of bytes in an encoded varint (63 bits of payload).
pub const MAX_LEN: usize = 9;

/// Decodes a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf` ends before
/// the final byte of the varint.
pub fn read(buf: &[u8]) -> Result<Option<(u64, usize)>, Error> {
    let mut result: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_LEN {
            return Err(Error::InvalidVarint);
        }
        result |= u64::from(byte & DATA_BITS_MASK) << (i as u32 * DATA_BITS_PER_BYTE);
        if byte & CONTINUATION_BIT_MASK == 0 {
            // A trailing zero group could have been omitted
            if *byte == 0 && i > 0 {
                return Err(Error::InvalidVarint);
            }
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= MAX_LEN {
        return Err(Error::InvalidVarint);
    }
    Ok(None)
}

/// Encodes `value` into `buf`.
pub fn write(value: u64, buf: &mut impl BufMut) {
    let mut val = value;
    while val >= u64::from(CONTINUATION_BIT_MASK) {
        buf.put_u8((val as u8) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Returns the number of bytes needed to encode `value`.
pub fn size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(DATA_BITS_PER_BYTE as usize).max(1)
}
