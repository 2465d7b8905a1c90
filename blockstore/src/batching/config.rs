use crate::budget::Budget;
use std::time::Duration;

/// Configuration for the [Engine](super::Engine).
pub struct Config<I> {
    /// Index used to locate requested blocks.
    pub index: I,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Largest distance between consecutive offsets of a batch.
    pub max_gap: u64,

    /// Largest number of blocks fetched by a single range read.
    pub max_batch_size: usize,

    /// Largest framed section expected in a shard.
    ///
    /// Every range read is padded by this much past its last offset.
    pub max_block_length: u64,

    /// How long to wait for more requests after the first request of a flush arrives.
    ///
    /// If `None`, a flush starts as soon as the requests already queued have been absorbed.
    pub flush_delay: Option<Duration>,

    /// Admission control for the bytes of each range read, if any.
    pub budget: Option<Budget>,

    /// Whether to check resolved blocks against their CID.
    pub verify: bool,
}
