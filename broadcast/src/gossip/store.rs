//! Bookkeeping of which items exist, which we hold and which each neighbor holds.

use crate::{Block, Digest, Item, Kind};
use keysim_p2p::PeerId;
use std::collections::{BTreeMap, BTreeSet};

/// Items known to a single participant.
///
/// An item is `known` once any neighbor has announced it (or we created it) and `fetched` once
/// we hold it in full. `known` is always a superset of `fetched`.
#[derive(Default)]
pub struct Store {
    /// Every item we have heard of, by digest.
    known: BTreeMap<Digest, Item>,

    /// Every item we hold, by digest.
    fetched: BTreeMap<Digest, Item>,

    /// Digests each neighbor is believed to hold.
    ///
    /// Updated when the neighbor announces or sends an item and (optimistically) when we
    /// announce an item to them.
    by_peer: BTreeMap<PeerId, BTreeSet<Digest>>,
}

impl Store {
    /// Returns the number of items we have heard of.
    pub fn known(&self) -> usize {
        self.known.len()
    }

    /// Returns the number of items we hold.
    pub fn fetched(&self) -> usize {
        self.fetched.len()
    }

    /// Add a locally created item, returning whether it was new.
    pub fn insert(&mut self, item: Item) -> bool {
        let digest = item.digest();
        if self.fetched.contains_key(&digest) {
            return false;
        }
        self.known.insert(digest, item.clone());
        self.fetched.insert(digest, item);
        true
    }

    /// Record items announced by `peer`, returning how many we had never heard of.
    pub fn announced(&mut self, peer: PeerId, items: Vec<Item>) -> usize {
        let holdings = self.by_peer.entry(peer).or_default();
        let mut new = 0;
        for item in items {
            let digest = item.digest();
            holdings.insert(digest);
            if self.known.insert(digest, item).is_none() {
                new += 1;
            }
        }
        new
    }

    /// Record items sent by `peer`, returning those we did not already hold.
    pub fn received(&mut self, peer: PeerId, items: Vec<Item>) -> Vec<Item> {
        let holdings = self.by_peer.entry(peer).or_default();
        let mut new = Vec::new();
        for item in items {
            let digest = item.digest();
            holdings.insert(digest);
            if self.fetched.contains_key(&digest) {
                continue;
            }
            self.known.insert(digest, item.clone());
            self.fetched.insert(digest, item.clone());
            new.push(item);
        }
        new
    }

    /// Returns the items we hold among the requested `digests`.
    pub fn requested(&self, digests: &[Digest]) -> Vec<Item> {
        digests
            .iter()
            .filter_map(|digest| self.fetched.get(digest).cloned())
            .collect()
    }

    /// Returns the items we hold that `peer` is not known to hold.
    pub fn unannounced(&self, peer: &PeerId) -> Vec<Item> {
        let holdings = self.by_peer.get(peer);
        self.fetched
            .iter()
            .filter(|(digest, _)| holdings.map_or(true, |holdings| !holdings.contains(*digest)))
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Record that `peer` now holds the given items.
    pub fn mark(&mut self, peer: PeerId, digests: impl IntoIterator<Item = Digest>) {
        self.by_peer.entry(peer).or_default().extend(digests);
    }

    /// Returns the digests `peer` holds that we do not.
    pub fn missing(&self, peer: &PeerId) -> Vec<Digest> {
        let Some(holdings) = self.by_peer.get(peer) else {
            return Vec::new();
        };
        holdings
            .iter()
            .filter(|digest| !self.fetched.contains_key(*digest))
            .copied()
            .collect()
    }

    /// Returns the items we hold that match the filter.
    pub fn matching(
        &self,
        kinds: &BTreeSet<Kind>,
        block: Option<Block>,
        exclude: &BTreeSet<Digest>,
    ) -> BTreeSet<Item> {
        self.fetched
            .iter()
            .filter(|(digest, item)| !exclude.contains(*digest) && matches(item, kinds, block))
            .map(|(_, item)| item.clone())
            .collect()
    }
}

/// Returns whether an item is of one of the given `kinds` (and in `block`, if provided).
pub fn matches(item: &Item, kinds: &BTreeSet<Kind>, block: Option<Block>) -> bool {
    kinds.contains(&item.kind()) && block.map_or(true, |block| block == item.block())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(token: u64) -> Item {
        Item::Transaction { block: 0, token }
    }

    fn witness(block: Block, sender: u32) -> Item {
        Item::Witness {
            block,
            sender: PeerId::new(sender),
        }
    }

    #[test]
    fn test_insert_dedup() {
        let mut store = Store::default();
        assert!(store.insert(tx(1)));
        assert!(!store.insert(tx(1)));
        assert_eq!(store.fetched(), 1);
        assert_eq!(store.known(), 1);
    }

    #[test]
    fn test_received_dedup() {
        let mut store = Store::default();
        let peer = PeerId::new(1);
        let new = store.received(peer, vec![tx(1), tx(2)]);
        assert_eq!(new.len(), 2);
        let new = store.received(peer, vec![tx(2), tx(3), tx(3)]);
        assert_eq!(new, vec![tx(3)]);
        assert_eq!(store.fetched(), 3);
        assert!(store.unannounced(&peer).is_empty());
    }

    #[test]
    fn test_announced_then_missing() {
        let mut store = Store::default();
        let peer = PeerId::new(1);
        store.insert(tx(1));
        assert_eq!(store.announced(peer, vec![tx(1), tx(2)]), 1);
        assert_eq!(store.announced(peer, vec![tx(2)]), 0);
        assert_eq!(store.known(), 2);
        assert_eq!(store.fetched(), 1);
        assert_eq!(store.missing(&peer), vec![tx(2).digest()]);
        assert!(store.missing(&PeerId::new(2)).is_empty());

        // Once fetched, nothing is missing
        store.received(peer, vec![tx(2)]);
        assert!(store.missing(&peer).is_empty());
    }

    #[test]
    fn test_unannounced_delta() {
        let mut store = Store::default();
        let peer = PeerId::new(1);
        store.insert(tx(1));
        store.insert(tx(2));
        assert_eq!(store.unannounced(&peer).len(), 2);
        store.mark(peer, [tx(1).digest()]);
        assert_eq!(store.unannounced(&peer), vec![tx(2)]);
        store.mark(peer, [tx(2).digest()]);
        assert!(store.unannounced(&peer).is_empty());
    }

    #[test]
    fn test_requested_only_fetched() {
        let mut store = Store::default();
        let peer = PeerId::new(1);
        store.insert(tx(1));
        store.announced(peer, vec![tx(2)]);
        let items = store.requested(&[tx(1).digest(), tx(2).digest()]);
        assert_eq!(items, vec![tx(1)]);
    }

    #[test]
    fn test_matching() {
        let mut store = Store::default();
        store.insert(tx(1));
        store.insert(witness(1, 1));
        store.insert(witness(2, 1));
        store.insert(witness(2, 2));

        let kinds = BTreeSet::from([Kind::Witness]);
        let all = store.matching(&kinds, None, &BTreeSet::new());
        assert_eq!(all.len(), 3);

        let block = store.matching(&kinds, Some(2), &BTreeSet::new());
        assert_eq!(block.len(), 2);

        let exclude = BTreeSet::from([witness(2, 1).digest()]);
        let rest = store.matching(&kinds, Some(2), &exclude);
        assert_eq!(rest, BTreeSet::from([witness(2, 2)]));

        let none = store.matching(&BTreeSet::from([Kind::Vote]), None, &BTreeSet::new());
        assert!(none.is_empty());
    }
}
