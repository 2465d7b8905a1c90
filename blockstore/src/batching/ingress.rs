use crate::{
    index::{Entry, Index},
    Block, Blockstore, Error,
};
use cid::Cid;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use tracing::trace;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// Fetch a block that has been located.
    ///
    /// The request can be canceled by dropping the responder.
    Get {
        cid: Cid,
        entry: Entry,
        responder: oneshot::Sender<Result<Option<Block>, Error>>,
    },
}

/// Ingress mailbox for [Engine](super::Engine).
///
/// Blocks are located with the configured index before the request is handed to the
/// engine, so a block the index does not know about resolves immediately.
#[derive(Clone)]
pub struct Mailbox<I: Index> {
    index: I,
    sender: mpsc::Sender<Message>,
}

impl<I: Index> Mailbox<I> {
    pub(super) fn new(index: I, sender: mpsc::Sender<Message>) -> Self {
        Self { index, sender }
    }
}

impl<I: Index> Blockstore for Mailbox<I> {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, Error> {
        let Some(entry) = self.index.get(cid).await? else {
            trace!(%cid, "not indexed");
            return Ok(None);
        };
        let (responder, receiver) = oneshot::channel();
        let mut sender = self.sender.clone();
        sender
            .send(Message::Get {
                cid: *cid,
                entry,
                responder,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}
