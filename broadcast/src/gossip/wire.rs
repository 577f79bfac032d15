//! Messages exchanged between gossip engines.

use crate::{
    item::{BLOCK_NUMBER_SIZE, ITEM_HASH_SIZE},
    Digest, Item,
};
use keysim_p2p::Payload;

/// Size of the envelope around every message.
pub const ENVELOPE_SIZE: usize = 20;

/// Size of a single entry in an announcement.
pub const ANNOUNCEMENT_SIZE: usize = BLOCK_NUMBER_SIZE + ITEM_HASH_SIZE;

/// Message sent to a neighbor.
#[derive(Clone, Debug)]
pub enum Message {
    /// Items the sender has fetched (only their identities are paid for on the wire).
    Announce(Vec<Item>),
    /// Digests of items the sender would like to receive.
    Request(Vec<Digest>),
    /// Full items, sent in response to a request.
    Send(Vec<Item>),
}

impl Payload for Message {
    fn size(&self) -> usize {
        ENVELOPE_SIZE
            + match self {
                Message::Announce(items) => items.len() * ANNOUNCEMENT_SIZE,
                Message::Request(digests) => digests.len() * ITEM_HASH_SIZE,
                Message::Send(items) => items.iter().map(Item::size).sum(),
            }
    }
}
