use super::{Entry, Index, ShardIndex, Source};
use crate::{store::Store, Error};
use cid::Cid;
use commonware_runtime::Spawner;
use futures::{stream::FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::trace;

/// Aggregates many indexes (typically one [ShardIndex] per shard of a DAG).
///
/// A lookup queries every index concurrently and returns the first positive answer.
/// If no index knows the block, the lookup resolves as not found unless one of them
/// failed, in which case the first failure is returned.
#[derive(Clone)]
pub struct MultiIndex<I: Index> {
    indexes: Arc<Vec<I>>,
}

impl<I: Index> MultiIndex<I> {
    pub fn new(indexes: Vec<I>) -> Self {
        Self {
            indexes: Arc::new(indexes),
        }
    }

    /// Number of aggregated indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Whether no indexes are aggregated.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl MultiIndex<ShardIndex> {
    /// Build (in the background) the index of every shard in `shards`.
    pub fn init<E: Spawner, S: Store>(context: E, store: S, shards: &[Cid]) -> Self {
        let indexes = shards
            .iter()
            .map(|shard| {
                ShardIndex::init(context.clone(), store.clone(), *shard, Source::shard(shard))
            })
            .collect();
        Self::new(indexes)
    }
}

impl<I: Index> Index for MultiIndex<I> {
    async fn get(&self, cid: &Cid) -> Result<Option<Entry>, Error> {
        let mut lookups = self
            .indexes
            .iter()
            .map(|index| index.get(cid))
            .collect::<FuturesUnordered<_>>();
        let mut failure = None;
        while let Some(result) = lookups.next().await {
            match result {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(err) => {
                    trace!(%cid, ?err, "index lookup failed");
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::format, mocks, store::Memory};
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    #[test_traced]
    fn test_finds_block_in_any_shard() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::new(32);
            let first = mocks::Shard::new(vec![b"one".to_vec(), b"two".to_vec()]);
            let second = mocks::Shard::new(vec![b"three".to_vec(), b"four".to_vec()]);
            first.put(&store);
            second.put(&store);

            let index = MultiIndex::init(context, store, &[first.cid, second.cid]);
            assert_eq!(index.len(), 2);
            for shard in [&first, &second] {
                for (cid, offset) in shard.locations() {
                    let entry = index.get(&cid).await.unwrap().unwrap();
                    assert_eq!(entry.shard, shard.cid);
                    assert_eq!(entry.offset, offset);
                }
            }
            assert!(index.get(&mocks::raw(b"five")).await.unwrap().is_none());
        });
    }

    #[test_traced]
    fn test_positive_answer_wins_over_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = Memory::default();
            let good = mocks::Shard::new(vec![b"block".to_vec()]);
            good.put(&store);
            let broken = mocks::raw(b"broken");
            store.put(crate::store::index_key(&broken), b"not an index".to_vec());

            let index = MultiIndex::init(context, store, &[broken, good.cid]);
            let (cid, _) = good.locations()[0];
            assert!(index.get(&cid).await.unwrap().is_some());

            // Without a positive answer, the failure surfaces
            let err = index.get(&mocks::raw(b"other")).await.unwrap_err();
            assert!(matches!(err, Error::IndexFailed { shard, .. } if shard == broken));
        });
    }

    #[test_traced]
    fn test_empty_aggregate() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let index = MultiIndex::<ShardIndex>::new(Vec::new());
            assert!(index.is_empty());
            assert!(index.get(&mocks::raw(b"any")).await.unwrap().is_none());
        });
    }

    #[test_traced]
    fn test_all_missing_is_not_found() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let wanted = mocks::raw(b"wanted");
            let indexes = (0..3)
                .map(|i| {
                    let other = mocks::raw(&[i]);
                    let bytes = format::encode(&[(*other.hash(), 0)]);
                    let body = futures::stream::iter(vec![Ok(Bytes::from(bytes))]).boxed();
                    ShardIndex::from_body(context.clone(), mocks::raw(&[i, i]), None, body)
                })
                .collect();
            let index = MultiIndex::new(indexes);
            assert!(index.get(&wanted).await.unwrap().is_none());
        });
    }
}
