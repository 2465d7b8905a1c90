//! Group pending block reads into batches that can each be served by one range read.
//!
//! Reads are grouped per shard (offsets are only meaningful within one shard). Each call to
//! [Batcher::next] takes the shard that has been waiting longest, sorts its offsets, and
//! greedily accumulates a run starting at the smallest one: an offset joins the run only if
//! it is less than `max_gap` bytes past the previous member and the run holds fewer than
//! `max_batch_size` reads. Whatever is left over stays pending for a later batch.

use cid::Cid;
use std::collections::{HashMap, VecDeque};

/// Largest distance between consecutive offsets of a batch.
pub const MAX_GAP: u64 = 2 * 1024 * 1024;

/// Largest number of reads in a batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// A pending read of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// CID of the block.
    pub cid: Cid,

    /// Offset of the block's section within the shard.
    pub offset: u64,
}

/// Reads of a single shard whose offsets are close together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Shard holding every block of the batch.
    pub shard: Cid,

    /// Reads, in ascending order of offset.
    pub requests: Vec<Request>,
}

impl Batch {
    /// Smallest offset of the batch.
    pub fn first(&self) -> u64 {
        self.requests.first().map_or(0, |request| request.offset)
    }

    /// Largest offset of the batch.
    pub fn last(&self) -> u64 {
        self.requests.last().map_or(0, |request| request.offset)
    }
}

/// Accumulates reads and hands them out in gap- and size-bounded batches.
pub struct Batcher {
    max_gap: u64,
    max_batch_size: usize,

    order: VecDeque<Cid>,
    pending: HashMap<Cid, Vec<Request>>,
    len: usize,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(MAX_GAP, MAX_BATCH_SIZE)
    }
}

impl Batcher {
    pub fn new(max_gap: u64, max_batch_size: usize) -> Self {
        Self {
            max_gap,
            max_batch_size: max_batch_size.max(1),
            order: VecDeque::new(),
            pending: HashMap::new(),
            len: 0,
        }
    }

    /// Queue a read of `cid` at `offset` within `shard`.
    pub fn add(&mut self, shard: Cid, cid: Cid, offset: u64) {
        let requests = self.pending.entry(shard).or_insert_with(|| {
            self.order.push_back(shard);
            Vec::new()
        });
        requests.push(Request { cid, offset });
        self.len += 1;
    }

    /// Number of pending reads.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no reads are pending.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Iterator for Batcher {
    type Item = Batch;

    /// Take the next batch, if any reads are pending.
    fn next(&mut self) -> Option<Batch> {
        let shard = self.order.pop_front()?;
        let mut requests = self.pending.remove(&shard)?;
        requests.sort_by_key(|request| request.offset);

        let mut take = 1;
        while take < requests.len() && take < self.max_batch_size {
            let gap = requests[take].offset - requests[take - 1].offset;
            if gap >= self.max_gap {
                break;
            }
            take += 1;
        }
        let leftover = requests.split_off(take);
        if !leftover.is_empty() {
            self.pending.insert(shard, leftover);
            self.order.push_back(shard);
        }
        self.len -= requests.len();
        Some(Batch { shard, requests })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
    use test_case::test_case;

    fn offsets(batch: &Batch) -> Vec<u64> {
        batch.requests.iter().map(|request| request.offset).collect()
    }

    #[test]
    fn test_gap_bound() {
        let shard = mocks::raw(b"shard");
        let mut batcher = Batcher::default();
        for offset in [0u64, 100, 3_000_000] {
            batcher.add(shard, mocks::raw(&offset.to_be_bytes()), offset);
        }
        assert_eq!(batcher.len(), 3);

        let first = batcher.next().unwrap();
        assert_eq!(first.shard, shard);
        assert_eq!(offsets(&first), vec![0, 100]);
        let second = batcher.next().unwrap();
        assert_eq!(offsets(&second), vec![3_000_000]);
        assert!(batcher.next().is_none());
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batch_size_bound() {
        let shard = mocks::raw(b"shard");
        let mut batcher = Batcher::default();
        for offset in 0..150u64 {
            batcher.add(shard, mocks::raw(&offset.to_be_bytes()), offset);
        }

        let first = batcher.next().unwrap();
        assert_eq!(first.requests.len(), 100);
        assert_eq!(batcher.len(), 50);
        let second = batcher.next().unwrap();
        assert_eq!(offsets(&second), (100..150).collect::<Vec<_>>());
        assert!(batcher.next().is_none());
    }

    #[test_case(MAX_GAP - 1, 1; "just under gap")]
    #[test_case(MAX_GAP, 2; "exactly gap")]
    #[test_case(MAX_GAP + 1, 2; "over gap")]
    fn test_gap_is_exclusive(second: u64, batches: usize) {
        let shard = mocks::raw(b"shard");
        let mut batcher = Batcher::default();
        batcher.add(shard, mocks::raw(b"a"), 0);
        batcher.add(shard, mocks::raw(b"b"), second);
        assert_eq!(batcher.count(), batches);
    }

    #[test]
    fn test_shards_never_mix() {
        let first = mocks::raw(b"first");
        let second = mocks::raw(b"second");
        let mut batcher = Batcher::default();
        batcher.add(first, mocks::raw(b"a"), 10);
        batcher.add(second, mocks::raw(b"b"), 20);
        batcher.add(first, mocks::raw(b"c"), 30);

        let batch = batcher.next().unwrap();
        assert_eq!(batch.shard, first);
        assert_eq!(offsets(&batch), vec![10, 30]);
        let batch = batcher.next().unwrap();
        assert_eq!(batch.shard, second);
        assert_eq!(offsets(&batch), vec![20]);
        assert!(batcher.next().is_none());
    }

    #[test]
    fn test_leftovers_yield_to_other_shards() {
        let first = mocks::raw(b"first");
        let second = mocks::raw(b"second");
        let mut batcher = Batcher::new(MAX_GAP, 2);
        for offset in 0..3u64 {
            batcher.add(first, mocks::raw(&offset.to_be_bytes()), offset);
        }
        batcher.add(second, mocks::raw(b"other"), 0);

        let shards: Vec<_> = batcher
            .map(|batch| (batch.shard, batch.requests.len()))
            .collect();
        assert_eq!(shards, vec![(first, 2), (second, 1), (first, 1)]);
    }

    #[test]
    fn test_unsorted_input() {
        let shard = mocks::raw(b"shard");
        let mut rng = StdRng::seed_from_u64(0);
        let mut input: Vec<u64> = (0..50).map(|i| i * 1000).collect();
        input.shuffle(&mut rng);

        let mut batcher = Batcher::default();
        for offset in &input {
            batcher.add(shard, mocks::raw(&offset.to_be_bytes()), *offset);
        }
        let batch = batcher.next().unwrap();
        assert_eq!(batch.first(), 0);
        assert_eq!(batch.last(), 49_000);
        assert!(offsets(&batch).windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(batch.requests[0].cid, mocks::raw(&0u64.to_be_bytes()));
    }
}
