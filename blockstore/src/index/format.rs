//! Encode and incrementally decode sorted multihash indexes.
//!
//! # Format
//!
//! An index begins with `varint(codec)`:
//!
//! - `0x0400` (IndexSorted): `i32` bucket count, then per bucket a `u32` record width,
//!   a `u64` byte length, and `length / width` records of `digest | u64 offset`. Every
//!   digest is a sha2-256 digest.
//! - `0x0401` (MultihashIndexSorted): `i32` code count, then per code a `u64` multihash
//!   code followed by an IndexSorted body (without the codec prefix).
//!
//! All fixed-width integers are little-endian. Within a bucket, records share a width and
//! are sorted by digest.
//!
//! # Streaming
//!
//! [Decoder] accepts input in arbitrarily sized chunks and yields records as soon as
//! they are complete, which lets an index answer lookups before it has been read in full.

use crate::{varint, Error, SHA2_256};
use bytes::{Buf, BufMut, BytesMut};
use cid::multihash::Multihash;
use std::collections::BTreeMap;

/// Codec of an IndexSorted index.
pub const INDEX_SORTED: u64 = 0x0400;

/// Codec of a MultihashIndexSorted index.
pub const MULTIHASH_INDEX_SORTED: u64 = 0x0401;

/// Size of the offset stored at the end of each record.
const OFFSET_LEN: u32 = 8;

/// Largest digest a record may hold.
const MAX_DIGEST_LEN: u32 = 64;

/// Decoder progress.
///
/// `codes` counts the codes still to be read after the current one and `widths` counts
/// the buckets of the current code still to be read (including the one being read).
#[derive(Clone, Copy, Debug)]
enum State {
    Codec,
    CodeCount,
    Code {
        codes: u32,
    },
    WidthCount {
        codes: u32,
        code: u64,
    },
    Bucket {
        codes: u32,
        code: u64,
        widths: u32,
    },
    Records {
        codes: u32,
        code: u64,
        widths: u32,
        width: u32,
        records: u64,
    },
    Done,
}

/// Incrementally decodes `(multihash, offset)` records.
pub struct Decoder {
    buffer: BytesMut,
    state: State,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::Codec,
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete record, if one is buffered.
    pub fn next_entry(&mut self) -> Result<Option<(Multihash<64>, u64)>, Error> {
        loop {
            match self.state {
                State::Codec => {
                    let Some((codec, read)) = varint::read(&self.buffer)? else {
                        return Ok(None);
                    };
                    self.buffer.advance(read);
                    self.state = match codec {
                        INDEX_SORTED => State::WidthCount {
                            codes: 0,
                            code: SHA2_256,
                        },
                        MULTIHASH_INDEX_SORTED => State::CodeCount,
                        other => return Err(Error::UnsupportedIndex(other)),
                    };
                }
                State::CodeCount => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let count = count(self.buffer.get_i32_le())?;
                    self.state = next_code(count);
                }
                State::Code { codes } => {
                    if self.buffer.len() < 8 {
                        return Ok(None);
                    }
                    let code = self.buffer.get_u64_le();
                    self.state = State::WidthCount {
                        codes: codes - 1,
                        code,
                    };
                }
                State::WidthCount { codes, code } => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let widths = count(self.buffer.get_i32_le())?;
                    self.state = if widths == 0 {
                        next_code(codes)
                    } else {
                        State::Bucket {
                            codes,
                            code,
                            widths,
                        }
                    };
                }
                State::Bucket {
                    codes,
                    code,
                    widths,
                } => {
                    if self.buffer.len() < 12 {
                        return Ok(None);
                    }
                    let width = self.buffer.get_u32_le();
                    let length = self.buffer.get_u64_le();
                    if width <= OFFSET_LEN || width - OFFSET_LEN > MAX_DIGEST_LEN {
                        return Err(Error::InvalidIndex("invalid record width"));
                    }
                    if length % u64::from(width) != 0 {
                        return Err(Error::InvalidIndex("bucket length not a multiple of width"));
                    }
                    let records = length / u64::from(width);
                    self.state = if records == 0 {
                        next_bucket(codes, code, widths - 1)
                    } else {
                        State::Records {
                            codes,
                            code,
                            widths: widths - 1,
                            width,
                            records,
                        }
                    };
                }
                State::Records {
                    codes,
                    code,
                    widths,
                    width,
                    records,
                } => {
                    if self.buffer.len() < width as usize {
                        return Ok(None);
                    }
                    let digest_len = (width - OFFSET_LEN) as usize;
                    let multihash = Multihash::wrap(code, &self.buffer[..digest_len])
                        .map_err(|_| Error::InvalidIndex("invalid multihash"))?;
                    self.buffer.advance(digest_len);
                    let offset = self.buffer.get_u64_le();
                    self.state = if records == 1 {
                        next_bucket(codes, code, widths)
                    } else {
                        State::Records {
                            codes,
                            code,
                            widths,
                            width,
                            records: records - 1,
                        }
                    };
                    return Ok(Some((multihash, offset)));
                }
                State::Done => {
                    if !self.buffer.is_empty() {
                        return Err(Error::InvalidIndex("trailing bytes"));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Verify that the input ended on the boundary of a complete index.
    pub fn finish(&self) -> Result<(), Error> {
        match self.state {
            State::Done if self.buffer.is_empty() => Ok(()),
            State::Done => Err(Error::InvalidIndex("trailing bytes")),
            _ => Err(Error::IndexTruncated),
        }
    }
}

fn count(value: i32) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::InvalidIndex("negative count"))
}

fn next_code(codes: u32) -> State {
    if codes == 0 {
        State::Done
    } else {
        State::Code { codes }
    }
}

fn next_bucket(codes: u32, code: u64, widths: u32) -> State {
    if widths == 0 {
        next_code(codes)
    } else {
        State::Bucket {
            codes,
            code,
            widths,
        }
    }
}

/// Decode a complete index held in memory.
pub fn decode(bytes: &[u8]) -> Result<Vec<(Multihash<64>, u64)>, Error> {
    let mut decoder = Decoder::new();
    decoder.push(bytes);
    let mut entries = Vec::new();
    while let Some(entry) = decoder.next_entry()? {
        entries.push(entry);
    }
    decoder.finish()?;
    Ok(entries)
}

/// Encode `entries` as a MultihashIndexSorted index.
pub fn encode(entries: &[(Multihash<64>, u64)]) -> Vec<u8> {
    // code -> width -> sorted records
    let mut groups: BTreeMap<u64, BTreeMap<u32, Vec<(&[u8], u64)>>> = BTreeMap::new();
    for (multihash, offset) in entries {
        let width = multihash.digest().len() as u32 + OFFSET_LEN;
        groups
            .entry(multihash.code())
            .or_default()
            .entry(width)
            .or_default()
            .push((multihash.digest(), *offset));
    }

    let mut buf = BytesMut::new();
    varint::write(MULTIHASH_INDEX_SORTED, &mut buf);
    buf.put_i32_le(groups.len() as i32);
    for (code, buckets) in groups.iter_mut() {
        buf.put_u64_le(*code);
        buf.put_i32_le(buckets.len() as i32);
        for (width, records) in buckets.iter_mut() {
            records.sort();
            buf.put_u32_le(*width);
            buf.put_u64_le(records.len() as u64 * u64::from(*width));
            for (digest, offset) in records.iter() {
                buf.put_slice(digest);
                buf.put_u64_le(*offset);
            }
        }
    }
    buf.to_vec()
}
