//! Read objects from a range-addressable object store.
//!
//! Shards and their sorted indexes are stored under keys derived from the shard's CID
//! (see [shard_key] and [index_key]). A [Store] exposes just enough to read them: the
//! size of an object and a (possibly ranged) streaming read.
//!
//! Ranges that extend past the end of an object are clamped, so a padded read of the last
//! section of a shard returns whatever bytes remain rather than failing.

use crate::Error;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;
use std::future::Future;

mod http;
pub use http::Http;
mod memory;
pub use memory::Memory;

/// Streaming body of an object.
pub type Body = BoxStream<'static, Result<Bytes, Error>>;

/// A byte range within an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    /// First byte of the range.
    pub offset: u64,

    /// Number of bytes in the range (to the end of the object if `None`).
    pub length: Option<u64>,
}

impl Range {
    /// Resolve the range against an object of `size` bytes.
    ///
    /// Returns the clamped `[start, end)` bounds.
    pub fn clamp(&self, size: u64) -> (u64, u64) {
        let start = self.offset.min(size);
        let end = match self.length {
            Some(length) => self.offset.saturating_add(length).min(size),
            None => size,
        };
        (start, end)
    }
}

/// Metadata of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Head {
    /// Total size of the object.
    pub size: u64,
}

/// An object (or a range of one) being read.
pub struct Object {
    /// Total size of the object.
    pub size: u64,

    /// Bytes of the requested range.
    pub body: Body,
}

/// Interface to read objects by key.
pub trait Store: Clone + Send + Sync + 'static {
    /// Fetch the metadata of an object, if it exists.
    fn head(&self, key: &str) -> impl Future<Output = Result<Option<Head>, Error>> + Send;

    /// Read an object (or the given range of it), if it exists.
    fn get(
        &self,
        key: &str,
        range: Option<Range>,
    ) -> impl Future<Output = Result<Option<Object>, Error>> + Send;
}

/// Key of a shard.
pub fn shard_key(shard: &Cid) -> String {
    format!("{shard}/{shard}.car")
}

/// Key of a shard's sorted index.
pub fn index_key(shard: &Cid) -> String {
    format!("{shard}/{shard}.car.idx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use test_case::test_case;

    #[test_case(Range { offset: 0, length: None }, 100, (0, 100); "whole object")]
    #[test_case(Range { offset: 10, length: Some(20) }, 100, (10, 30); "inside")]
    #[test_case(Range { offset: 90, length: Some(20) }, 100, (90, 100); "past end")]
    #[test_case(Range { offset: 120, length: Some(20) }, 100, (100, 100); "after end")]
    #[test_case(Range { offset: 5, length: Some(u64::MAX) }, 100, (5, 100); "saturating")]
    fn test_range_clamp(range: Range, size: u64, expected: (u64, u64)) {
        assert_eq!(range.clamp(size), expected);
    }

    #[test]
    fn test_keys() {
        let shard = mocks::raw(b"shard");
        assert_eq!(shard_key(&shard), format!("{shard}/{shard}.car"));
        assert_eq!(index_key(&shard), format!("{shard}/{shard}.car.idx"));
    }
}
