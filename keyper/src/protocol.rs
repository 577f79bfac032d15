//! Per-block state of the key generation handshake.

use crate::Error;
use keysim_broadcast::{Block, Item};
use keysim_p2p::PeerId;
use std::collections::BTreeSet;

/// Progress of the handshake for a single block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a secret share and a witness from every other keyper.
    AwaitingShares,
    /// Waiting for a nonce from every other keyper.
    AwaitingNonces,
    /// Every contribution has been collected.
    Advancing,
}

/// Contributions collected from other keypers for one block.
///
/// Never contains contributions attributed to ourselves or to a different block.
#[derive(Clone, Debug)]
pub struct Protocol {
    me: PeerId,
    block: Block,
    others: BTreeSet<PeerId>,

    shares: BTreeSet<PeerId>,
    witnesses: BTreeSet<PeerId>,
    nonces: BTreeSet<PeerId>,
    nonce_published: bool,
}

impl Protocol {
    /// Create a fresh handshake for `block` among `keypers` (which may include `me`).
    pub fn new(me: PeerId, block: Block, keypers: &BTreeSet<PeerId>) -> Self {
        let others = keypers.iter().copied().filter(|k| *k != me).collect();
        Self {
            me,
            block,
            others,
            shares: BTreeSet::new(),
            witnesses: BTreeSet::new(),
            nonces: BTreeSet::new(),
            nonce_published: false,
        }
    }

    /// Returns the block of the handshake.
    pub fn block(&self) -> Block {
        self.block
    }

    /// Returns the keypers (other than ourselves) taking part in the handshake.
    pub fn others(&self) -> &BTreeSet<PeerId> {
        &self.others
    }

    /// Record an item, returning whether it contributed to the handshake.
    ///
    /// Items of unrelated kinds, secret shares addressed to someone else and items from peers
    /// that are not keypers are ignored.
    pub fn record(&mut self, item: &Item) -> Result<bool, Error> {
        if item.block() != self.block {
            return Err(Error::WrongBlock {
                expected: self.block,
                found: item.block(),
            });
        }
        let Some(sender) = item.sender() else {
            return Ok(false);
        };
        if sender == self.me {
            return Err(Error::SelfAttributed(item.kind()));
        }
        if !self.others.contains(&sender) {
            return Ok(false);
        }
        let recorded = match item {
            Item::SecretShare { receiver, .. } if *receiver == self.me => {
                self.shares.insert(sender)
            }
            Item::Witness { .. } => self.witnesses.insert(sender),
            Item::Nonce { .. } => self.nonces.insert(sender),
            _ => false,
        };
        Ok(recorded)
    }

    /// Returns whether a share and a witness have been received from every other keyper.
    pub fn key_distribution_finished(&self) -> bool {
        self.shares == self.others && self.witnesses == self.others
    }

    /// Returns whether key distribution has finished and every other keyper published a nonce.
    pub fn nonce_collection_finished(&self) -> bool {
        self.key_distribution_finished() && self.nonces == self.others
    }

    /// Marks our nonce as published, returning `true` the first time it is called after key
    /// distribution finished.
    pub fn publish_nonce(&mut self) -> bool {
        if self.nonce_published || !self.key_distribution_finished() {
            return false;
        }
        self.nonce_published = true;
        true
    }

    /// Returns the current phase of the handshake.
    pub fn phase(&self) -> Phase {
        if !self.key_distribution_finished() {
            Phase::AwaitingShares
        } else if !self.nonce_collection_finished() {
            Phase::AwaitingNonces
        } else {
            Phase::Advancing
        }
    }

    /// Returns the number of `(shares, witnesses, nonces)` recorded.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.shares.len(), self.witnesses.len(), self.nonces.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysim_broadcast::Kind;

    fn peer(id: u32) -> PeerId {
        PeerId::new(id)
    }

    fn keypers() -> BTreeSet<PeerId> {
        (0..3).map(peer).collect()
    }

    fn share(block: Block, sender: u32, receiver: u32) -> Item {
        Item::SecretShare {
            block,
            sender: peer(sender),
            receiver: peer(receiver),
        }
    }

    fn witness(block: Block, sender: u32) -> Item {
        Item::Witness {
            block,
            sender: peer(sender),
        }
    }

    fn nonce(block: Block, sender: u32) -> Item {
        Item::Nonce {
            block,
            sender: peer(sender),
        }
    }

    #[test]
    fn test_handshake() {
        let mut protocol = Protocol::new(peer(0), 4, &keypers());
        assert_eq!(protocol.others().len(), 2);
        assert_eq!(protocol.phase(), Phase::AwaitingShares);
        assert!(!protocol.publish_nonce());

        assert!(protocol.record(&share(4, 1, 0)).unwrap());
        assert!(protocol.record(&witness(4, 1)).unwrap());
        assert!(protocol.record(&share(4, 2, 0)).unwrap());
        assert!(!protocol.key_distribution_finished());
        assert!(protocol.record(&witness(4, 2)).unwrap());
        assert!(protocol.key_distribution_finished());
        assert_eq!(protocol.phase(), Phase::AwaitingNonces);

        // Nonce is published exactly once
        assert!(protocol.publish_nonce());
        assert!(!protocol.publish_nonce());

        assert!(protocol.record(&nonce(4, 1)).unwrap());
        assert!(!protocol.nonce_collection_finished());
        assert!(protocol.record(&nonce(4, 2)).unwrap());
        assert!(protocol.nonce_collection_finished());
        assert_eq!(protocol.phase(), Phase::Advancing);
        assert_eq!(protocol.counts(), (2, 2, 2));
    }

    #[test]
    fn test_early_nonces_do_not_finish() {
        let mut protocol = Protocol::new(peer(0), 0, &keypers());
        protocol.record(&nonce(0, 1)).unwrap();
        protocol.record(&nonce(0, 2)).unwrap();
        assert!(!protocol.nonce_collection_finished());
        assert_eq!(protocol.phase(), Phase::AwaitingShares);
    }

    #[test]
    fn test_duplicates_and_foreign_shares() {
        let mut protocol = Protocol::new(peer(0), 0, &keypers());
        assert!(protocol.record(&witness(0, 1)).unwrap());
        assert!(!protocol.record(&witness(0, 1)).unwrap());

        // Shares addressed to another keyper do not count
        assert!(!protocol.record(&share(0, 1, 2)).unwrap());

        // Neither do contributions from peers that are not keypers
        assert!(!protocol.record(&witness(0, 7)).unwrap());

        // Nor items of other kinds
        assert!(!protocol.record(&Item::Transaction { block: 0, token: 1 }).unwrap());
        assert_eq!(protocol.counts(), (0, 1, 0));
    }

    #[test]
    fn test_witnesses_must_match_set() {
        let mut protocol = Protocol::new(peer(0), 0, &keypers());
        protocol.record(&share(0, 1, 0)).unwrap();
        protocol.record(&share(0, 2, 0)).unwrap();
        protocol.record(&witness(0, 1)).unwrap();
        assert!(!protocol.key_distribution_finished());
    }

    #[test]
    fn test_rejects_self_attributed() {
        let mut protocol = Protocol::new(peer(0), 0, &keypers());
        assert_eq!(
            protocol.record(&witness(0, 0)),
            Err(Error::SelfAttributed(Kind::Witness))
        );
        assert_eq!(
            protocol.record(&share(0, 0, 1)),
            Err(Error::SelfAttributed(Kind::SecretShare))
        );
        assert_eq!(protocol.counts(), (0, 0, 0));
    }

    #[test]
    fn test_rejects_wrong_block() {
        let mut protocol = Protocol::new(peer(0), 2, &keypers());
        assert_eq!(
            protocol.record(&nonce(3, 1)),
            Err(Error::WrongBlock {
                expected: 2,
                found: 3
            })
        );
        assert_eq!(protocol.counts(), (0, 0, 0));
    }
}
