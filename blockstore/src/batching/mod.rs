//! Serve concurrent block requests with as few range reads as possible.
//!
//! # Overview
//!
//! The core of the module is the [Engine]. It is responsible for:
//! - Deduplicating concurrent requests for the same block
//! - Grouping located blocks into gap- and size-bounded batches (see [crate::batcher])
//! - Fetching each batch with a single range read and decoding the blocks it contains
//!
//! The [Mailbox] implements [crate::Blockstore]. It locates the block with the configured
//! [crate::index::Index] and, if found, hands the request to the engine and waits for the
//! result.
//!
//! # Details
//!
//! Requests are served in flushes. A flush starts when a request arrives at an idle engine:
//! every request already queued in the mailbox (and, if `flush_delay` is set, every request
//! that arrives within the delay) joins it. Requests for a block that is already pending
//! wait on the existing read rather than issuing another. At most one flush runs at a time;
//! requests that arrive while a flush is running form the next one.
//!
//! Each batch is fetched with the range `[first, last + max_block_length)`, since the length
//! of the last wanted section is not known until its header is decoded. The range is decoded
//! section by section and every pending request whose multihash matches is resolved with a
//! copy of the block's bytes. Decoding stops as soon as every block of the batch has been
//! resolved, or when the range is exhausted (a partial section at the end of the range is
//! expected and ignored).
//!
//! A missing shard resolves its batch as not found. Any other store error (or malformed
//! framing) fails the unresolved requests of that batch only. Once every batch of a flush
//! has been processed, requests that are still pending resolve as not found.

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::Mailbox;
pub(crate) use ingress::Message;
mod metrics;
