//! Assign identities to roles and decide which peers are connected.

use crate::config::Config;
use keysim_p2p::PeerId;
use rand::{seq::SliceRandom, Rng};
use std::collections::{BTreeMap, BTreeSet};

/// Identities of every peer, by role.
///
/// Identities are sequential: keypers first, then users, the collator and validators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub keypers: Vec<PeerId>,
    pub users: Vec<PeerId>,
    pub collator: Option<PeerId>,
    pub validators: Vec<PeerId>,
}

impl Layout {
    pub fn new(cfg: &Config) -> Self {
        let mut next = 0u32;
        let mut take = |count: usize| {
            let ids: Vec<PeerId> = (next..next + count as u32).map(PeerId::new).collect();
            next += count as u32;
            ids
        };
        let keypers = take(cfg.keypers.count);
        let users = take(cfg.users.count);
        let collator = take(cfg.collator.enabled as usize).pop();
        let validators = take(cfg.validators.count);
        Self {
            keypers,
            users,
            collator,
            validators,
        }
    }

    /// Returns every peer (in ascending order).
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.keypers
            .iter()
            .chain(self.users.iter())
            .chain(self.collator.iter())
            .chain(self.validators.iter())
            .copied()
    }
}

/// Undirected links between peers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    neighbors: BTreeMap<PeerId, BTreeSet<PeerId>>,
}

impl Topology {
    /// Connect the peers of `layout` at random.
    ///
    /// - Each keyper connects to other keypers until it has `keypers.connections` neighbors.
    /// - Each user connects to one keyper and to other users until it has `users.connections`
    ///   user neighbors.
    /// - The collator connects to `collator.connections` keypers and users.
    /// - Each validator connects to `validators.connections` keypers.
    ///
    /// Every target is capped by the number of peers available.
    pub fn random<R: Rng>(rng: &mut R, layout: &Layout, cfg: &Config) -> Self {
        let mut topology = Self::default();
        for peer in layout.peers() {
            topology.neighbors.insert(peer, BTreeSet::new());
        }

        // Keypers form a random mesh
        let target = cfg.keypers.connections.min(layout.keypers.len().saturating_sub(1));
        for keyper in &layout.keypers {
            topology.fill(rng, *keyper, &layout.keypers, target);
        }

        // Users attach to a keyper and to each other
        let target = cfg.users.connections.min(layout.users.len().saturating_sub(1));
        for user in &layout.users {
            if let Some(keyper) = layout.keypers.choose(rng) {
                topology.connect(*user, *keyper);
            }
            topology.fill(rng, *user, &layout.users, target);
        }

        // The collator listens to keypers and users
        if let Some(collator) = layout.collator {
            let candidates: Vec<PeerId> = layout
                .keypers
                .iter()
                .chain(layout.users.iter())
                .copied()
                .collect();
            let count = cfg.collator.connections.min(candidates.len());
            for peer in candidates.choose_multiple(rng, count) {
                topology.connect(collator, *peer);
            }
        }

        // Validators listen to keypers
        let count = cfg.validators.connections.min(layout.keypers.len());
        for validator in &layout.validators {
            for keyper in layout.keypers.choose_multiple(rng, count) {
                topology.connect(*validator, *keyper);
            }
        }
        topology
    }

    /// Connect `peer` to random members of `group` until it has `target` neighbors in the group.
    fn fill<R: Rng>(&mut self, rng: &mut R, peer: PeerId, group: &[PeerId], target: usize) {
        loop {
            let candidates: Vec<PeerId> = group
                .iter()
                .copied()
                .filter(|other| *other != peer && !self.connected(peer, *other))
                .collect();
            let degree = group.len() - 1 - candidates.len();
            if degree >= target {
                return;
            }
            let Some(other) = candidates.choose(rng) else {
                return;
            };
            self.connect(peer, *other);
        }
    }

    fn connect(&mut self, a: PeerId, b: PeerId) {
        if a == b {
            return;
        }
        self.neighbors.entry(a).or_default().insert(b);
        self.neighbors.entry(b).or_default().insert(a);
    }

    /// Returns whether two peers are connected.
    pub fn connected(&self, a: PeerId, b: PeerId) -> bool {
        self.neighbors.get(&a).is_some_and(|n| n.contains(&b))
    }

    /// Returns the neighbors of a peer.
    pub fn neighbors(&self, peer: PeerId) -> impl Iterator<Item = PeerId> + '_ {
        self.neighbors.get(&peer).into_iter().flatten().copied()
    }

    /// Returns every link once, as `(lower, higher)`.
    pub fn links(&self) -> Vec<(PeerId, PeerId)> {
        self.neighbors
            .iter()
            .flat_map(|(a, neighbors)| {
                neighbors
                    .iter()
                    .filter(move |b| *a < **b)
                    .map(move |b| (*a, *b))
            })
            .collect()
    }
}
