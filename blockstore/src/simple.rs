//! Fetch each block with its own range read.
//!
//! Unlike [crate::batching], requests are neither deduplicated nor grouped. This is useful
//! when requests are rare or unrelated, or as a reference for the batching engine.

use crate::{
    car,
    index::Index,
    store::{shard_key, Range, Store},
    verify, Block, Error, MAX_ENCODED_BLOCK_LENGTH,
};
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use tracing::{debug, trace};

/// Configuration for [Blockstore].
pub struct Config<I> {
    /// Index used to locate requested blocks.
    pub index: I,

    /// Length to read when the index does not record a section's length.
    pub max_block_length: u64,

    /// Whether to check blocks against their CID.
    pub verify: bool,
}

impl<I> Config<I> {
    /// Default configuration around `index`.
    pub fn new(index: I) -> Self {
        Self {
            index,
            max_block_length: MAX_ENCODED_BLOCK_LENGTH,
            verify: false,
        }
    }
}

/// Blockstore that issues one range read per request.
#[derive(Clone)]
pub struct Blockstore<I: Index, S: Store> {
    index: I,
    store: S,
    max_block_length: u64,
    verify: bool,
}

impl<I: Index, S: Store> Blockstore<I, S> {
    pub fn new(store: S, cfg: Config<I>) -> Self {
        Self {
            index: cfg.index,
            store,
            max_block_length: cfg.max_block_length,
            verify: cfg.verify,
        }
    }
}

impl<I: Index, S: Store> crate::Blockstore for Blockstore<I, S> {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, Error> {
        let Some(entry) = self.index.get(cid).await? else {
            trace!(%cid, "not indexed");
            return Ok(None);
        };
        let range = Range {
            offset: entry.offset,
            length: Some(entry.length.unwrap_or(self.max_block_length)),
        };
        let Some(object) = self.store.get(&shard_key(&entry.shard), Some(range)).await? else {
            debug!(%cid, shard = %entry.shard, "shard not found");
            return Ok(None);
        };

        let mut body = object.body;
        let mut decoder = car::Decoder::new(entry.offset, self.max_block_length);
        while let Some(chunk) = body.next().await {
            decoder.push(&chunk?);
            let Some(section) = decoder.next_section()? else {
                continue;
            };
            if section.cid.hash() != cid.hash() {
                debug!(%cid, found = %section.cid, offset = entry.offset, "unexpected block");
                return Ok(None);
            }
            if self.verify {
                verify(&section.cid, &section.data)?;
            }
            return Ok(Some(Block {
                cid: *cid,
                bytes: Bytes::copy_from_slice(&section.data),
            }));
        }

        // The range ended before the section did
        debug!(%cid, shard = %entry.shard, offset = entry.offset, "block truncated");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::MultiIndex, mocks, store::Memory, Blockstore};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    #[test_traced]
    fn test_one_read_per_block() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new(16);
            let shard = mocks::Shard::new((0..5u8).map(|i| vec![i; 200]).collect());
            shard.put(&store);

            let index = MultiIndex::init(context, store.clone(), &[shard.cid]);
            let blockstore = super::Blockstore::new(store.clone(), Config::new(index));
            for block in shard.blocks() {
                assert_eq!(blockstore.get(&block.cid).await.unwrap().unwrap(), *block);
            }
            assert_eq!(store.gets(), 1 + shard.blocks().len());

            assert!(blockstore.get(&mocks::raw(b"unknown")).await.unwrap().is_none());
        });
    }

    #[test_traced]
    fn test_missing_shard() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::default();
            let shard = mocks::Shard::new(vec![b"block".to_vec()]);
            shard.put(&store);
            store.remove(&shard_key(&shard.cid));

            let index = MultiIndex::init(context, store.clone(), &[shard.cid]);
            let blockstore = super::Blockstore::new(store, Config::new(index));
            let cid = shard.blocks()[0].cid;
            assert!(blockstore.get(&cid).await.unwrap().is_none());
        });
    }

    #[test_traced]
    fn test_verify() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::default();
            let shard = mocks::Shard::new(vec![b"block".to_vec()]);
            shard.put(&store);
            let mut car = shard.car.to_vec();
            let last = car.len() - 1;
            car[last] ^= 0xff;
            store.put(shard_key(&shard.cid), car);

            let index = MultiIndex::init(context, store.clone(), &[shard.cid]);
            let mut cfg = Config::new(index);
            cfg.verify = true;
            let blockstore = super::Blockstore::new(store, cfg);
            let cid = shard.blocks()[0].cid;
            assert!(matches!(
                blockstore.get(&cid).await,
                Err(Error::DigestMismatch(c)) if c == cid
            ));
        });
    }
}
