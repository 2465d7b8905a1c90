//! Decode the length-prefixed block sections of a shard.
//!
//! A shard is a CARv1 archive: a header followed by sections of the form
//! `varint(len) | cid | data`, where `len` covers both the CID and the data. Sorted
//! indexes record the offset of the first byte of a section's varint, so a range read
//! starting at such an offset can be decoded without the archive header.
//!
//! # Truncated Tails
//!
//! Range reads are padded past the last wanted section because its length is unknown
//! until its header is decoded. The bytes at the end of such a range usually cut a
//! section in half. [Decoder] therefore never treats missing bytes as an error: it
//! returns `Ok(None)` until more input arrives, and whatever remains once the input is
//! exhausted is simply dropped. Only structurally invalid framing is reported.

use crate::{varint, Error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cid::Cid;

/// Length of a CIDv0 (a bare sha2-256 multihash).
const CIDV0_LEN: usize = 34;

/// Largest digest a [Cid] can hold.
const MAX_DIGEST_LEN: u64 = 64;

/// A decoded section.
#[derive(Clone, Debug)]
pub struct Section {
    /// CID of the block held by the section.
    pub cid: Cid,

    /// Offset of the section within the shard.
    pub offset: u64,

    /// Block data.
    ///
    /// This is a view into the decoder's buffer: copy it before retaining it.
    pub data: Bytes,
}

/// Location of a section's parts, relative to the start of its varint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Head {
    /// Length of the varint and the CID.
    pub header_len: usize,

    /// Length of the CID.
    pub cid_len: usize,

    /// Length of the block data.
    pub data_len: usize,
}

impl Head {
    /// Total length of the section.
    pub fn section_len(&self) -> usize {
        self.header_len + self.data_len
    }
}

/// Parse the length prefix and CID of the section at the front of `buf`.
///
/// Returns `None` if `buf` ends before the header does.
pub fn read_head(buf: &[u8], max_section: u64) -> Result<Option<(Head, Cid)>, Error> {
    let Some((len, prefix)) = varint::read(buf)? else {
        return Ok(None);
    };
    if len > max_section {
        return Err(Error::SectionTooLarge(len));
    }
    let Some(cid_len) = cid_len(&buf[prefix..])? else {
        return Ok(None);
    };
    if (cid_len as u64) > len {
        return Err(Error::InvalidSection(len));
    }
    let header_len = prefix + cid_len;
    let cid = Cid::try_from(&buf[prefix..header_len])
        .map_err(|err| Error::InvalidCid(err.to_string()))?;
    let head = Head {
        header_len,
        cid_len,
        data_len: len as usize - cid_len,
    };
    Ok(Some((head, cid)))
}

/// Determine the encoded length of the CID at the front of `buf`.
fn cid_len(buf: &[u8]) -> Result<Option<usize>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] == 0x12 && buf[1] == 0x20 {
        return Ok(Some(CIDV0_LEN));
    }

    // version, codec, multihash code, digest size
    let mut cursor = 0;
    let mut fields = [0u64; 4];
    for field in fields.iter_mut() {
        let Some((value, read)) = varint::read(&buf[cursor..])? else {
            return Ok(None);
        };
        *field = value;
        cursor += read;
    }
    let [version, _, _, size] = fields;
    if version != 1 {
        return Err(Error::InvalidCid(format!("unsupported version: {version}")));
    }
    if size > MAX_DIGEST_LEN {
        return Err(Error::InvalidCid(format!("digest too large: {size}")));
    }
    let total = cursor + size as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Incrementally decodes sections from a byte stream that begins on a section boundary.
pub struct Decoder {
    buffer: BytesMut,
    position: u64,
    max_section: u64,
}

impl Decoder {
    /// Create a decoder for a stream whose first byte is at `offset` within the shard.
    pub fn new(offset: u64, max_section: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            position: offset,
            max_section,
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete section, if one is buffered.
    pub fn next_section(&mut self) -> Result<Option<Section>, Error> {
        let Some((head, cid)) = read_head(&self.buffer, self.max_section)? else {
            return Ok(None);
        };
        if self.buffer.len() < head.section_len() {
            return Ok(None);
        }
        let offset = self.position;
        self.buffer.advance(head.header_len);
        let data = self.buffer.split_to(head.data_len).freeze();
        self.position = self.position.saturating_add(head.section_len() as u64);
        Ok(Some(Section { cid, offset, data }))
    }

    /// Offset (within the shard) of the next undecoded byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of buffered bytes that do not yet form a complete section.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a section holding `data` under `cid`.
pub fn write_section(cid: &Cid, data: &[u8], buf: &mut impl BufMut) {
    let cid = cid.to_bytes();
    varint::write((cid.len() + data.len()) as u64, buf);
    buf.put_slice(&cid);
    buf.put_slice(data);
}
