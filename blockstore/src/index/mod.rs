//! Locate the shard and byte offset of a block.
//!
//! # Overview
//!
//! An [Index] answers `get(cid)` with the [Entry] describing where the block addressed by
//! `cid` lives, or `None` if it does not know. Entries are keyed by multihash, so two CIDs
//! that differ only in codec resolve to the same location.
//!
//! Three implementations are provided:
//!
//! - [ShardIndex]: built by streaming the sorted index published alongside one shard.
//!   Lookups issued while the index is still building wait for the key to be decoded (or
//!   for the build to finish, at which point they resolve as not found).
//! - [MultiIndex]: fans a lookup out to many indexes and returns the first match.
//! - [ClaimsIndex]: discovers locations on demand by reading relation claims and decoding
//!   the sorted indexes embedded in them.

use crate::Error;
use cid::{multihash::Multihash, Cid};
use std::future::Future;

mod claims;
pub use claims::{Claim, Claims, ClaimsIndex, Config as ClaimsConfig, Kind, Part};
pub mod format;
mod multi;
pub use multi::MultiIndex;
mod shard;
pub use shard::{ShardIndex, Source, Status};

/// Location of a block within a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Multihash of the block.
    pub multihash: Multihash<64>,

    /// Offset of the block's section within the shard.
    pub offset: u64,

    /// Length of the block's section, if known.
    pub length: Option<u64>,

    /// The shard holding the block.
    pub shard: Cid,

    /// The shard named by the claim this entry was discovered from.
    ///
    /// Only set for entries that did not come from a static per-shard index.
    pub origin: Option<Cid>,
}

/// Interface to locate blocks.
pub trait Index: Clone + Send + Sync + 'static {
    /// Locate the block addressed by `cid`.
    ///
    /// Returns `None` if the index does not contain the block.
    fn get(&self, cid: &Cid) -> impl Future<Output = Result<Option<Entry>, Error>> + Send;
}
