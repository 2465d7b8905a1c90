//! Locate and batch-fetch content-addressed blocks from sharded archives.
//!
//! Blocks live inside immutable archives ("shards") held by a range-addressable object
//! [store::Store]. An [index::Index] maps a block's multihash to the shard and byte offset
//! that holds it, and a [Blockstore] turns that location into bytes.
//!
//! # Components
//!
//! - [index::ShardIndex]: streams a shard's sorted multihash index and answers lookups
//!   while it is still building.
//! - [index::MultiIndex]: queries many indexes concurrently and returns the first match.
//! - [index::ClaimsIndex]: discovers locations lazily from signed relation claims.
//! - [batcher::Batcher]: groups pending reads per shard into gap- and size-bounded batches.
//! - [batching::Engine]: deduplicates concurrent requests and serves each batch with a single
//!   range read.
//! - [simple::Blockstore]: issues one range read per block.
//! - [budget::Budget]: FIFO admission control for bytes held in flight.
//!
//! # Status
//!
//! `gateway-blockstore` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use bytes::Bytes;
use cid::Cid;
use sha2::{Digest as _, Sha256};
use std::{future::Future, sync::Arc};
use thiserror::Error;

pub mod batcher;
pub mod batching;
pub mod budget;
pub mod car;
pub mod index;
pub mod mocks;
pub mod simple;
pub mod store;
pub mod varint;

/// Codec of a raw (leaf) block.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash code of sha2-256.
pub const SHA2_256: u64 = 0x12;

/// Multihash code of the identity hash.
pub const IDENTITY: u64 = 0x00;

/// Largest framed section (length prefix, CID, and data) a shard may contain.
///
/// Blocks are at most 2 MiB; the remainder covers the length prefix and the CID.
pub const MAX_ENCODED_BLOCK_LENGTH: u64 = 2 * 1024 * 1024 + 39 + 61;

/// Errors that can occur when locating or fetching blocks.
///
/// Absence (of a shard, an index, or a block) is never an error: lookups return `Ok(None)`.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid cid: {0}")]
    InvalidCid(String),
    #[error("invalid section length: {0}")]
    InvalidSection(u64),
    #[error("section too large: {0}")]
    SectionTooLarge(u64),
    #[error("unsupported index codec: {0:#x}")]
    UnsupportedIndex(u64),
    #[error("invalid index: {0}")]
    InvalidIndex(&'static str),
    #[error("index truncated")]
    IndexTruncated,
    #[error("index for shard {shard} failed")]
    IndexFailed {
        shard: Cid,
        #[source]
        source: Arc<Error>,
    },
    #[error("digest mismatch: {0}")]
    DigestMismatch(Cid),
    #[error("store error: {0}")]
    Store(String),
    #[error("claims error: {0}")]
    Claims(String),
    #[error("request of {requested} bytes exceeds budget of {max}")]
    BudgetExceeded { requested: u64, max: u64 },
    #[error("closed")]
    Closed,
}

/// A CID paired with its raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub bytes: Bytes,
}

/// Interface to retrieve blocks by CID.
pub trait Blockstore: Clone + Send + Sync + 'static {
    /// Retrieve the block addressed by `cid`, if it can be located.
    fn get(&self, cid: &Cid) -> impl Future<Output = Result<Option<Block>, Error>> + Send;
}

/// Check that `bytes` hash to the multihash of `cid`.
///
/// Multihashes other than sha2-256 and identity are accepted without verification.
pub fn verify(cid: &Cid, bytes: &[u8]) -> Result<(), Error> {
    let hash = cid.hash();
    let valid = match hash.code() {
        SHA2_256 => Sha256::digest(bytes).as_slice() == hash.digest(),
        IDENTITY => bytes == hash.digest(),
        _ => true,
    };
    if !valid {
        return Err(Error::DigestMismatch(*cid));
    }
    Ok(())
}
