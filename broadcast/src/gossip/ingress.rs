use crate::{Block, Digest, Distributor, Error, Item, Kind};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::collections::BTreeSet;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// Make an item available to the network.
    Distribute { item: Item },

    /// Wait for items matching a filter.
    ///
    /// The responder is sent a non-empty set of matching items as soon as one is available.
    /// The request is canceled by dropping the responder.
    Subscribe {
        kinds: BTreeSet<Kind>,
        block: Option<Block>,
        exclude: BTreeSet<Digest>,
        responder: oneshot::Sender<BTreeSet<Item>>,
    },

    /// Request a snapshot of the engine's state.
    Inventory {
        responder: oneshot::Sender<Inventory>,
    },
}

/// Snapshot of an [`Engine`](super::Engine)'s holdings and outbound traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Number of items heard of.
    pub known: usize,
    /// Number of items held.
    pub fetched: usize,
    /// Number of pending requests from local services.
    pub waiters: usize,
    /// Number of announcements sent.
    pub announcements: u64,
    /// Number of requests sent.
    pub requests: u64,
    /// Number of replies sent.
    pub replies: u64,
}

/// Ingress mailbox for [`Engine`](super::Engine).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Returns a snapshot of the engine's state.
    pub async fn inventory(&mut self) -> Result<Inventory, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Inventory { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }
}

impl Distributor for Mailbox {
    async fn distribute(&mut self, item: Item) -> Result<(), Error> {
        self.sender
            .send(Message::Distribute { item })
            .await
            .map_err(|_| Error::Closed)
    }

    async fn get_items(
        &mut self,
        kinds: &[Kind],
        block: Option<Block>,
        exclude: &BTreeSet<Digest>,
    ) -> Result<BTreeSet<Item>, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Subscribe {
                kinds: kinds.iter().copied().collect(),
                block,
                exclude: exclude.clone(),
                responder,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }
}
