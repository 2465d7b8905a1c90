use super::{format, Entry, Index};
use crate::{
    store::{index_key, Body, Store},
    Error,
};
use cid::{multihash::Multihash, Cid};
use commonware_runtime::Spawner;
use futures::{channel::oneshot, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Where to read a shard's sorted index from.
#[derive(Clone, Debug)]
pub struct Source {
    /// Key of the index object.
    pub key: String,

    /// Provenance to attach to every entry read from the index.
    pub origin: Option<Cid>,
}

impl Source {
    /// The index stored alongside `shard`.
    pub fn shard(shard: &Cid) -> Self {
        Self {
            key: index_key(shard),
            origin: None,
        }
    }
}

/// Build status of a [ShardIndex].
#[derive(Clone, Debug)]
pub enum Status {
    /// The index is still being read.
    Building,
    /// Every entry has been read.
    Ready,
    /// Reading failed. The index will never become ready.
    Failed(Arc<Error>),
}

type Waiter = oneshot::Sender<Result<Option<Entry>, Error>>;

struct State {
    entries: HashMap<Multihash<64>, Entry>,
    waiters: HashMap<Multihash<64>, Vec<Waiter>>,
    status: Status,
}

/// Index of the blocks in a single shard.
///
/// The index is populated in the background from a stream of the shard's sorted index.
/// Lookups for entries that have already been decoded are answered immediately. Other
/// lookups wait until the entry is decoded or the build completes (resolving as not found).
/// If the build fails, waiting lookups and all future lookups fail with
/// [Error::IndexFailed].
#[derive(Clone)]
pub struct ShardIndex {
    shard: Cid,
    state: Arc<Mutex<State>>,
}

impl ShardIndex {
    fn new(shard: Cid) -> Self {
        Self {
            shard,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                waiters: HashMap::new(),
                status: Status::Building,
            })),
        }
    }

    /// Build the index of `shard` by reading `source` from `store`.
    ///
    /// A missing index object yields an empty (ready) index.
    pub fn init<E: Spawner, S: Store>(context: E, store: S, shard: Cid, source: Source) -> Self {
        let index = Self::new(shard);
        let builder = index.clone();
        context.spawn(move |_| async move {
            let result = match store.get(&source.key, None).await {
                Ok(Some(object)) => builder.ingest(object.body, source.origin).await,
                Ok(None) => {
                    warn!(shard = %builder.shard, key = %source.key, "index missing");
                    Ok(0)
                }
                Err(err) => Err(err),
            };
            builder.complete(result);
        });
        index
    }

    /// Build the index of `shard` from a stream of its sorted index.
    pub fn from_body<E: Spawner>(context: E, shard: Cid, origin: Option<Cid>, body: Body) -> Self {
        let index = Self::new(shard);
        let builder = index.clone();
        context.spawn(move |_| async move {
            let result = builder.ingest(body, origin).await;
            builder.complete(result);
        });
        index
    }

    /// The shard this index describes.
    pub fn shard(&self) -> &Cid {
        &self.shard
    }

    /// Current build status.
    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status.clone()
    }

    /// Number of entries decoded so far.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether no entries have been decoded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn ingest(&self, mut body: Body, origin: Option<Cid>) -> Result<usize, Error> {
        let mut decoder = format::Decoder::new();
        let mut count = 0;
        while let Some(chunk) = body.next().await {
            decoder.push(&chunk?);

            // Keep whatever was decoded before a malformed record
            let mut entries = Vec::new();
            let decoded = loop {
                match decoder.next_entry() {
                    Ok(Some((multihash, offset))) => entries.push(Entry {
                        multihash,
                        offset,
                        length: None,
                        shard: self.shard,
                        origin,
                    }),
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };
            count += entries.len();
            self.insert(entries);
            decoded?;
        }
        decoder.finish()?;
        Ok(count)
    }

    fn insert(&self, entries: Vec<Entry>) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for entry in entries {
            if let Some(waiters) = state.waiters.remove(&entry.multihash) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(Some(entry.clone())));
                }
            }
            state.entries.insert(entry.multihash, entry);
        }
    }

    fn complete(&self, result: Result<usize, Error>) {
        let mut state = self.state.lock().unwrap();
        let waiters = std::mem::take(&mut state.waiters);
        match result {
            Ok(entries) => {
                debug!(shard = %self.shard, entries, unresolved = waiters.len(), "index ready");
                state.status = Status::Ready;
                for waiter in waiters.into_values().flatten() {
                    let _ = waiter.send(Ok(None));
                }
            }
            Err(err) => {
                warn!(shard = %self.shard, ?err, "index failed");
                let err = Arc::new(err);
                state.status = Status::Failed(err.clone());
                for waiter in waiters.into_values().flatten() {
                    let _ = waiter.send(Err(Error::IndexFailed {
                        shard: self.shard,
                        source: err.clone(),
                    }));
                }
            }
        }
    }
}

impl Index for ShardIndex {
    async fn get(&self, cid: &Cid) -> Result<Option<Entry>, Error> {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.entries.get(cid.hash()) {
                return Ok(Some(entry.clone()));
            }
            match &state.status {
                Status::Ready => return Ok(None),
                Status::Failed(err) => {
                    return Err(Error::IndexFailed {
                        shard: self.shard,
                        source: err.clone(),
                    })
                }
                Status::Building => {}
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.entry(*cid.hash()).or_default().push(sender);
            receiver
        };
        receiver.await.map_err(|_| Error::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks, store::Memory};
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Runner};
    use futures::{
        channel::mpsc,
        join,
        task::{self, ArcWake},
        FutureExt,
    };
    use std::{future::Future, time::Duration};

    #[test_traced]
    fn test_lookup_after_build() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new(16);
            let shard = mocks::Shard::new((0..10u8).map(|i| vec![i; 100]).collect());
            shard.put(&store);

            let source = Source::shard(&shard.cid);
            let index = ShardIndex::init(context, store.clone(), shard.cid, source);
            for (cid, offset) in shard.locations() {
                let entry = index.get(&cid).await.unwrap().unwrap();
                assert_eq!(entry.offset, offset);
                assert_eq!(entry.shard, shard.cid);
                assert_eq!(entry.length, None);
                assert_eq!(entry.origin, None);
            }
            assert!(matches!(index.status(), Status::Ready));
            assert_eq!(index.len(), 10);

            // Unknown keys stay unknown without re-reading the source
            let unknown = mocks::raw(b"unknown");
            for _ in 0..3 {
                assert!(index.get(&unknown).await.unwrap().is_none());
            }
            assert_eq!(store.gets(), 1);
        });
    }

    #[test_traced]
    fn test_lookup_waits_for_entry() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let wanted = mocks::raw(b"wanted");
            let unknown = mocks::raw(b"unknown");
            let (sender, receiver) = mpsc::unbounded();
            let index = ShardIndex::from_body(context.clone(), shard, None, receiver.boxed());

            let bytes = format::encode(&[(*wanted.hash(), 42)]);
            context.clone().spawn(move |context| async move {
                context.sleep(Duration::from_millis(10)).await;
                sender.unbounded_send(Ok(Bytes::from(bytes))).unwrap();
            });

            assert!(matches!(index.status(), Status::Building));
            let (found, missing) = join!(index.get(&wanted), index.get(&unknown));
            assert_eq!(found.unwrap().unwrap().offset, 42);
            assert!(missing.unwrap().is_none());
            assert!(matches!(index.status(), Status::Ready));
        });
    }

    #[test_traced]
    fn test_concurrent_waiters_share_entry() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let wanted = mocks::raw(b"wanted");
            let (sender, receiver) = mpsc::unbounded();
            let index = ShardIndex::from_body(context.clone(), shard, None, receiver.boxed());

            let first = index.clone();
            let second = index.clone();
            let (a, b, _) = join!(first.get(&wanted), second.get(&wanted), async move {
                context.sleep(Duration::from_millis(5)).await;
                let bytes = format::encode(&[(*wanted.hash(), 7)]);
                sender.unbounded_send(Ok(Bytes::from(bytes))).unwrap();
            });
            assert_eq!(a.unwrap(), b.unwrap());
        });
    }

    #[test_traced]
    fn test_decoded_entry_answers_while_building() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let wanted = mocks::raw(b"wanted");
            let (sender, receiver) = mpsc::unbounded();
            let index = ShardIndex::from_body(context.clone(), shard, None, receiver.boxed());

            let bytes = format::encode(&[(*wanted.hash(), 11)]);
            sender.unbounded_send(Ok(Bytes::from(bytes))).unwrap();
            while index.is_empty() {
                context.sleep(Duration::from_millis(1)).await;
            }

            // The stream is still open
            assert!(matches!(index.status(), Status::Building));
            let entry = index.get(&wanted).now_or_never().unwrap().unwrap().unwrap();
            assert_eq!(entry.offset, 11);
            assert!(index.get(&mocks::raw(b"other")).now_or_never().is_none());

            drop(sender);
            assert!(index.get(&mocks::raw(b"other")).await.unwrap().is_none());
            assert!(matches!(index.status(), Status::Ready));
        });
    }

    /// Records the order in which lookups are woken.
    struct Recorder {
        id: usize,
        woken: Arc<Mutex<Vec<usize>>>,
    }

    impl ArcWake for Recorder {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.woken.lock().unwrap().push(arc_self.id);
        }
    }

    #[test_traced]
    fn test_waiters_resolve_in_registration_order() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let wanted = mocks::raw(b"wanted");
            let (sender, receiver) = mpsc::unbounded();
            let index = ShardIndex::from_body(context.clone(), shard, None, receiver.boxed());

            let woken = Arc::new(Mutex::new(Vec::new()));
            let mut lookups = Vec::new();
            for id in 0..8 {
                let mut lookup = Box::pin(index.get(&wanted));
                let waker = task::waker(Arc::new(Recorder {
                    id,
                    woken: woken.clone(),
                }));
                let mut cx = task::Context::from_waker(&waker);
                assert!(lookup.as_mut().poll(&mut cx).is_pending());
                lookups.push(lookup);
            }

            let bytes = format::encode(&[(*wanted.hash(), 5)]);
            sender.unbounded_send(Ok(Bytes::from(bytes))).unwrap();
            while index.is_empty() {
                context.sleep(Duration::from_millis(1)).await;
            }

            assert_eq!(*woken.lock().unwrap(), (0..8).collect::<Vec<_>>());
            for lookup in lookups {
                assert_eq!(lookup.await.unwrap().unwrap().offset, 5);
            }
        });
    }

    #[test_traced]
    fn test_missing_index_is_empty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::default();
            let shard = mocks::raw(b"shard");
            let index = ShardIndex::init(context, store, shard, Source::shard(&shard));
            assert!(index.get(&mocks::raw(b"block")).await.unwrap().is_none());
            assert!(matches!(index.status(), Status::Ready));
            assert!(index.is_empty());
        });
    }

    #[test_traced]
    fn test_transport_error_is_sticky() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::default();
            let shard = mocks::Shard::new(vec![b"block".to_vec()]);
            shard.put(&store);
            store.fail(index_key(&shard.cid));

            let source = Source::shard(&shard.cid);
            let index = ShardIndex::init(context, store.clone(), shard.cid, source);
            let (cid, _) = shard.locations()[0];
            for _ in 0..2 {
                let err = index.get(&cid).await.unwrap_err();
                let Error::IndexFailed { shard: failed, source } = err else {
                    panic!("unexpected error: {err:?}");
                };
                assert_eq!(failed, shard.cid);
                assert!(matches!(*source, Error::Store(_)));
            }
            assert!(matches!(index.status(), Status::Failed(_)));
            assert_eq!(store.gets(), 1);
        });
    }

    #[test_traced]
    fn test_stream_error_fails_waiters() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let wanted = mocks::raw(b"wanted");
            let (sender, receiver) = mpsc::unbounded();
            let index = ShardIndex::from_body(context.clone(), shard, None, receiver.boxed());

            let (result, _) = join!(index.get(&wanted), async move {
                context.sleep(Duration::from_millis(5)).await;
                sender
                    .unbounded_send(Err(Error::Store("connection reset".into())))
                    .unwrap();
            });
            assert!(matches!(result, Err(Error::IndexFailed { .. })));
            assert!(matches!(
                index.get(&wanted).await,
                Err(Error::IndexFailed { .. })
            ));
        });
    }

    #[test_traced]
    fn test_truncated_index_fails() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let first = mocks::raw(b"first");
            let second = mocks::raw(b"second");
            let mut bytes = format::encode(&[(*first.hash(), 1), (*second.hash(), 2)]);
            bytes.truncate(bytes.len() - 4);
            let body = futures::stream::iter(vec![Ok(Bytes::from(bytes))]).boxed();
            let index = ShardIndex::from_body(context, mocks::raw(b"shard"), None, body);

            let err = index.get(&mocks::raw(b"other")).await.unwrap_err();
            let Error::IndexFailed { source, .. } = err else {
                panic!("unexpected error: {err:?}");
            };
            assert!(matches!(*source, Error::IndexTruncated));

            // Entries decoded before the failure remain, the rest fail
            let results = [index.get(&first).await, index.get(&second).await];
            let found = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
            let failed = results.iter().filter(|r| r.is_err()).count();
            assert_eq!(found + failed, 2);
            assert_eq!(found, 1);
        });
    }

    #[test_traced]
    fn test_origin_is_attached() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shard = mocks::raw(b"shard");
            let origin = mocks::raw(b"origin");
            let wanted = mocks::raw(b"wanted");
            let bytes = format::encode(&[(*wanted.hash(), 3)]);
            let body = futures::stream::iter(vec![Ok(Bytes::from(bytes))]).boxed();
            let index = ShardIndex::from_body(context, shard, Some(origin), body);
            let entry = index.get(&wanted).await.unwrap().unwrap();
            assert_eq!(entry.origin, Some(origin));
        });
    }
}
