use super::{format, Entry, Index};
use crate::{verify, Block, Error, RAW_CODEC};
use cid::{multihash::Multihash, Cid};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Kind of a content claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Content is located at a URL.
    Location,
    /// Content was written as the given shards.
    Partition,
    /// Content includes the given content.
    Inclusion,
    /// Content links to children and is held by parts (which may include an index).
    Relation,
    /// Content is equivalent to other content.
    Equivalency,
}

/// A shard named by a relation claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// CID of the shard.
    pub content: Cid,

    /// CID of the sorted index of the shard, if the claim includes one.
    pub includes: Option<Cid>,
}

/// A signed assertion about some content.
#[derive(Clone, Debug)]
pub struct Claim {
    /// Kind of claim.
    pub kind: Kind,

    /// Content the claim is about.
    pub content: Cid,

    /// Shards holding the content (relation claims only).
    pub parts: Vec<Part>,

    /// Blocks carried with the claim.
    pub blocks: Vec<Block>,
}

impl Claim {
    /// Blocks exported with the claim (including any embedded indexes).
    pub fn export(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

/// Interface to a content claims service.
pub trait Claims: Clone + Send + Sync + 'static {
    /// Read the claims made about `cid`.
    fn read(
        &self,
        cid: &Cid,
        service: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Claim>, Error>> + Send;
}

/// Configuration for [ClaimsIndex].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Claims service to read from (the client's default if `None`).
    pub service: Option<String>,
}

type Read = Shared<BoxFuture<'static, Result<usize, Error>>>;

struct State {
    entries: HashMap<Multihash<64>, Entry>,
    reads: HashMap<Cid, Read>,
}

/// Index that discovers block locations from relation claims.
///
/// Claims for a CID are read at most once (concurrent lookups share a single read). Each
/// relation claim names the shards holding the content along with the CID of an index for
/// each shard, embedded as a block in the claim. Every entry of every embedded index is
/// cached, so the claims for a DAG's root usually locate its children as well.
///
/// A lookup for a cached non-raw CID still reads that CID's claims, since they typically
/// locate the CID's children.
#[derive(Clone)]
pub struct ClaimsIndex<C: Claims> {
    claims: C,
    service: Option<String>,
    state: Arc<Mutex<State>>,
}

impl<C: Claims> ClaimsIndex<C> {
    pub fn new(claims: C, cfg: Config) -> Self {
        Self {
            claims,
            service: cfg.service,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                reads: HashMap::new(),
            })),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, cid: &Cid) -> Option<Entry> {
        self.state.lock().unwrap().entries.get(cid.hash()).cloned()
    }

    /// Read (or join the in-flight read of) the claims for `cid`.
    ///
    /// A failed read is forgotten so that a later lookup may retry it. Only the failed read
    /// itself is forgotten, never a retry that replaced it.
    async fn read_claims(&self, cid: &Cid) -> Result<usize, Error> {
        let read = {
            let mut state = self.state.lock().unwrap();
            state
                .reads
                .entry(*cid)
                .or_insert_with(|| {
                    let index = self.clone();
                    let cid = *cid;
                    async move { index.fetch(cid).await }.boxed().shared()
                })
                .clone()
        };
        let result = read.clone().await;
        if result.is_err() {
            let mut state = self.state.lock().unwrap();
            if state.reads.get(cid).is_some_and(|current| current.ptr_eq(&read)) {
                state.reads.remove(cid);
            }
        }
        result
    }

    async fn fetch(&self, cid: Cid) -> Result<usize, Error> {
        let claims = self.claims.read(&cid, self.service.as_deref()).await?;
        let mut entries = Vec::new();
        for claim in claims.iter().filter(|claim| claim.kind == Kind::Relation) {
            let blocks: HashMap<_, _> = claim
                .export()
                .map(|block| (*block.cid.hash(), block))
                .collect();
            for part in &claim.parts {
                let Some(includes) = part.includes else {
                    continue;
                };
                let Some(block) = blocks.get(includes.hash()) else {
                    debug!(%cid, shard = %part.content, index = %includes, "index not exported");
                    continue;
                };
                if let Err(err) = verify(&includes, &block.bytes) {
                    warn!(%cid, shard = %part.content, ?err, "invalid embedded index");
                    continue;
                }
                let decoded = match format::decode(&block.bytes) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        warn!(%cid, shard = %part.content, ?err, "malformed embedded index");
                        continue;
                    }
                };
                entries.extend(decoded.into_iter().map(|(multihash, offset)| Entry {
                    multihash,
                    offset,
                    length: None,
                    shard: part.content,
                    origin: Some(part.content),
                }));
            }
        }

        let count = entries.len();
        debug!(%cid, claims = claims.len(), entries = count, "read claims");
        let mut state = self.state.lock().unwrap();
        for entry in entries {
            state.entries.insert(entry.multihash, entry);
        }
        Ok(count)
    }
}

impl<C: Claims> Index for ClaimsIndex<C> {
    async fn get(&self, cid: &Cid) -> Result<Option<Entry>, Error> {
        if let Some(entry) = self.cached(cid) {
            if cid.codec() != RAW_CODEC {
                if let Err(err) = self.read_claims(cid).await {
                    warn!(%cid, ?err, "failed to read claims for cached entry");
                }
            }
            return Ok(Some(entry));
        }
        self.read_claims(cid).await?;
        Ok(self.cached(cid))
    }
}
