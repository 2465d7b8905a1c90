//! Mock implementations for testing.

use crate::{
    car,
    index::{self, format, Claim, Kind, Part},
    store::{index_key, shard_key, Memory},
    varint, Block, Error, RAW_CODEC, SHA2_256,
};
use bytes::{BufMut, Bytes};
use cid::{multihash::Multihash, Cid};
use sha2::{Digest as _, Sha256};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

/// Codec of a CAR archive.
const CAR_CODEC: u64 = 0x0202;

/// DAG-CBOR encoding of `{"roots": [], "version": 1}`.
const CAR_HEADER: &[u8] = &[
    0xa2, 0x65, b'r', b'o', b'o', b't', b's', 0x80, 0x67, b'v', b'e', b'r', b's', b'i', b'o',
    b'n', 0x01,
];

/// sha2-256 multihash of `data`.
pub fn sha256(data: &[u8]) -> Multihash<64> {
    // A 32 byte digest always fits
    Multihash::wrap(SHA2_256, &Sha256::digest(data)).unwrap()
}

/// CID of `data` as a raw block.
pub fn raw(data: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODEC, sha256(data))
}

/// A CAR archive of raw blocks, along with its sorted index.
#[derive(Clone, Debug)]
pub struct Shard {
    /// CID of the archive.
    pub cid: Cid,

    /// Archive bytes.
    pub car: Bytes,

    /// Sorted index (`MultihashIndexSorted`) of the archive.
    pub index: Bytes,

    blocks: Vec<Block>,
    locations: Vec<(Cid, u64)>,
}

impl Shard {
    /// Build an archive holding each of `data` as a raw block, in order.
    pub fn new(data: Vec<Vec<u8>>) -> Self {
        let mut buf = Vec::new();
        varint::write(CAR_HEADER.len() as u64, &mut buf);
        buf.put_slice(CAR_HEADER);

        let mut blocks = Vec::with_capacity(data.len());
        let mut locations = Vec::with_capacity(data.len());
        for data in data {
            let cid = raw(&data);
            locations.push((cid, buf.len() as u64));
            car::write_section(&cid, &data, &mut buf);
            blocks.push(Block {
                cid,
                bytes: Bytes::from(data),
            });
        }
        let entries: Vec<_> = locations
            .iter()
            .map(|(cid, offset)| (*cid.hash(), *offset))
            .collect();
        let index = format::encode(&entries);
        Self {
            cid: Cid::new_v1(CAR_CODEC, sha256(&buf)),
            car: Bytes::from(buf),
            index: Bytes::from(index),
            blocks,
            locations,
        }
    }

    /// CID and section offset of every block, in archive order.
    pub fn locations(&self) -> Vec<(Cid, u64)> {
        self.locations.clone()
    }

    /// Blocks of the archive, in archive order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// CID of the sorted index.
    pub fn index_cid(&self) -> Cid {
        Cid::new_v1(format::MULTIHASH_INDEX_SORTED, sha256(&self.index))
    }

    /// Store the archive and its sorted index.
    pub fn put(&self, store: &Memory) {
        store.put(shard_key(&self.cid), self.car.clone());
        store.put(index_key(&self.cid), self.index.clone());
    }

    /// A relation claim stating that `content` is held by this archive, embedding its index.
    pub fn relation(&self, content: Cid) -> Claim {
        let includes = self.index_cid();
        Claim {
            kind: Kind::Relation,
            content,
            parts: vec![Part {
                content: self.cid,
                includes: Some(includes),
            }],
            blocks: vec![Block {
                cid: includes,
                bytes: self.index.clone(),
            }],
        }
    }
}

#[derive(Default)]
struct State {
    claims: HashMap<Cid, Vec<Claim>>,
    failing: HashSet<Cid>,
    reads: HashMap<Cid, usize>,
    services: Vec<Option<String>>,
}

/// In-memory claims service.
#[derive(Clone, Default)]
pub struct Claims {
    state: Arc<Mutex<State>>,
}

impl Claims {
    /// Publish `claim` about `cid`.
    ///
    /// Reads of `cid` that were failing succeed from now on.
    pub fn add(&self, cid: Cid, claim: Claim) {
        let mut state = self.state.lock().unwrap();
        state.failing.remove(&cid);
        state.claims.entry(cid).or_default().push(claim);
    }

    /// Make subsequent reads of `cid` fail.
    pub fn fail(&self, cid: Cid) {
        self.state.lock().unwrap().failing.insert(cid);
    }

    /// Number of reads of `cid`.
    pub fn reads(&self, cid: &Cid) -> usize {
        let state = self.state.lock().unwrap();
        state.reads.get(cid).copied().unwrap_or_default()
    }

    /// Service of every read, in order.
    pub fn services(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().services.clone()
    }
}

impl index::Claims for Claims {
    async fn read(&self, cid: &Cid, service: Option<&str>) -> Result<Vec<Claim>, Error> {
        let mut state = self.state.lock().unwrap();
        *state.reads.entry(*cid).or_default() += 1;
        state.services.push(service.map(str::to_string));
        if state.failing.contains(cid) {
            return Err(Error::Claims(format!("read of {cid} failed")));
        }
        Ok(state.claims.get(cid).cloned().unwrap_or_default())
    }
}
