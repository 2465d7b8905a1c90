use super::{metrics, Config, Mailbox, Message};
use crate::{
    batcher::{Batch, Batcher},
    budget::Budget,
    car,
    index::{Entry, Index},
    store::{shard_key, Range, Store},
    verify, Block, Error,
};
use bytes::Bytes;
use cid::{multihash::Multihash, Cid};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{
        mpsc::{self, TryRecvError},
        oneshot,
    },
    StreamExt,
};
use std::{
    collections::{hash_map, HashMap, HashSet},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// A caller waiting for a block.
struct Waiter {
    /// The CID the caller asked for.
    cid: Cid,

    /// The responder to send the block to.
    responder: oneshot::Sender<Result<Option<Block>, Error>>,
}

/// Instance of the main engine for the module.
///
/// It is responsible for:
/// - Deduplicating requests for the same block
/// - Grouping requests into batches
/// - Issuing one range read per batch and decoding the blocks it returns
/// - Resolving every request once its flush completes
pub struct Engine<E: Clock + Spawner + Metrics, S: Store> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,
    store: S,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    /// Padding added past the last offset of a batch
    max_block_length: u64,

    /// Time to wait for more requests before flushing
    flush_delay: Option<Duration>,

    /// Admission control for range reads
    budget: Option<Budget>,

    /// Whether to verify resolved blocks
    verify: bool,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving messages.
    mailbox_receiver: mpsc::Receiver<Message>,

    /// Pending requests, by multihash.
    waiters: HashMap<Multihash<64>, Vec<Waiter>>,

    /// Reads of the blocks that have waiters.
    batcher: Batcher,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    /// Metrics
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + Metrics, S: Store> Engine<E, S> {
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending messages to the engine.
    pub fn new<I: Index>(context: E, store: S, cfg: Config<I>) -> (Self, Mailbox<I>) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(cfg.index, mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());

        let result = Self {
            context,
            store,
            max_block_length: cfg.max_block_length,
            flush_delay: cfg.flush_delay,
            budget: cfg.budget,
            verify: cfg.verify,
            mailbox_receiver,
            waiters: HashMap::new(),
            batcher: Batcher::new(cfg.max_gap, cfg.max_batch_size),
            metrics,
        };

        (result, mailbox)
    }

    /// Starts the engine.
    ///
    /// The engine runs until every [Mailbox] has been dropped.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    /// Inner run loop called by `start`.
    async fn run(mut self) {
        loop {
            // Wait for the first request of the next flush
            let Some(message) = self.mailbox_receiver.next().await else {
                debug!("mailbox closed");
                break;
            };
            self.handle(message);

            // Let concurrent requests join the flush
            let mut closed = self.absorb();
            if let Some(delay) = self.flush_delay {
                if !closed {
                    self.context.sleep(delay).await;
                    closed = self.absorb();
                }
            }
            self.flush().await;
            if closed {
                debug!("mailbox closed");
                break;
            }
        }
    }

    /// Handle every message already queued in the mailbox.
    ///
    /// Returns whether the mailbox has been closed.
    fn absorb(&mut self) -> bool {
        loop {
            match self.mailbox_receiver.try_recv() {
                Ok(message) => self.handle(message),
                Err(TryRecvError::Closed) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Get {
                cid,
                entry,
                responder,
            } => {
                trace!(%cid, shard = %entry.shard, offset = entry.offset, "mailbox: get");
                self.metrics.requests.inc();
                self.register(cid, entry, responder);
            }
        }
    }

    /// Register a waiter, queueing a read only for the first waiter of a block.
    fn register(
        &mut self,
        cid: Cid,
        entry: Entry,
        responder: oneshot::Sender<Result<Option<Block>, Error>>,
    ) {
        let waiter = Waiter { cid, responder };
        match self.waiters.entry(*cid.hash()) {
            hash_map::Entry::Occupied(mut waiters) => waiters.get_mut().push(waiter),
            hash_map::Entry::Vacant(waiters) => {
                waiters.insert(vec![waiter]);
                self.batcher.add(entry.shard, cid, entry.offset);
            }
        }
        self.metrics.waiters.set(self.waiters.len() as i64);
    }

    /// Fetch every pending batch, then resolve whatever was not found.
    async fn flush(&mut self) {
        while let Some(batch) = self.batcher.next() {
            let wanted: HashSet<Multihash<64>> = batch
                .requests
                .iter()
                .map(|request| *request.cid.hash())
                .filter(|key| self.waiters.contains_key(key))
                .collect();
            if wanted.is_empty() {
                trace!(shard = %batch.shard, "batch already resolved");
                continue;
            }
            if let Err(err) = self.fetch(&batch, wanted).await {
                warn!(shard = %batch.shard, ?err, "batch failed");
                for request in &batch.requests {
                    self.fail(request.cid.hash(), &err);
                }
            }
        }

        // Requests not matched by any batch were not in their shard
        let unresolved: Vec<_> = self.waiters.drain().collect();
        for (key, waiters) in unresolved {
            debug!(?key, waiters = waiters.len(), "block not found");
            for waiter in waiters {
                self.metrics.misses.inc();
                let _ = waiter.responder.send(Ok(None));
            }
        }
        self.metrics.waiters.set(0);
    }

    /// Serve a batch with one range read.
    ///
    /// Returns once every wanted block has been resolved or the range is exhausted.
    async fn fetch(
        &mut self,
        batch: &Batch,
        mut wanted: HashSet<Multihash<64>>,
    ) -> Result<(), Error> {
        let first = batch.first();
        let length = (batch.last() - first).saturating_add(self.max_block_length);
        let _reservation = match &self.budget {
            Some(budget) => Some(budget.reserve(length).await?),
            None => None,
        };

        self.metrics.batches.inc();
        debug!(
            shard = %batch.shard,
            offset = first,
            length,
            blocks = wanted.len(),
            "fetching batch"
        );
        let range = Range {
            offset: first,
            length: Some(length),
        };
        let Some(object) = self.store.get(&shard_key(&batch.shard), Some(range)).await? else {
            debug!(shard = %batch.shard, "shard not found");
            for key in wanted {
                self.miss(&key);
            }
            return Ok(());
        };

        let mut body = object.body;
        let mut decoder = car::Decoder::new(first, self.max_block_length);
        while !wanted.is_empty() {
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk?;
            self.metrics.fetched_bytes.inc_by(chunk.len() as u64);
            decoder.push(&chunk);
            while let Some(section) = decoder.next_section()? {
                let key = *section.cid.hash();
                if !self.waiters.contains_key(&key) {
                    continue;
                }
                wanted.remove(&key);
                if self.verify {
                    if let Err(err) = verify(&section.cid, &section.data) {
                        warn!(cid = %section.cid, offset = section.offset, "digest mismatch");
                        self.fail(&key, &err);
                        continue;
                    }
                }
                self.hit(&key, Bytes::copy_from_slice(&section.data));
            }
        }

        // Truncated tails are expected at the padded end of the range
        trace!(
            shard = %batch.shard,
            position = decoder.position(),
            remaining = decoder.remaining(),
            unresolved = wanted.len(),
            "batch complete"
        );
        Ok(())
    }

    fn hit(&mut self, key: &Multihash<64>, bytes: Bytes) {
        let Some(waiters) = self.waiters.remove(key) else {
            return;
        };
        for waiter in waiters {
            self.metrics.hits.inc();
            let block = Block {
                cid: waiter.cid,
                bytes: bytes.clone(),
            };
            let _ = waiter.responder.send(Ok(Some(block)));
        }
    }

    fn miss(&mut self, key: &Multihash<64>) {
        let Some(waiters) = self.waiters.remove(key) else {
            return;
        };
        for waiter in waiters {
            self.metrics.misses.inc();
            let _ = waiter.responder.send(Ok(None));
        }
    }

    fn fail(&mut self, key: &Multihash<64>, err: &Error) {
        let Some(waiters) = self.waiters.remove(key) else {
            return;
        };
        for waiter in waiters {
            self.metrics.failures.inc();
            let _ = waiter.responder.send(Err(err.clone()));
        }
    }
}
