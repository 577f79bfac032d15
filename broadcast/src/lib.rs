//! Disseminate block-scoped items over a bandwidth-constrained network.
//!
//! Every participant runs a [Distributor] that accepts items from local services, shares them
//! with its neighbors and lets local services wait for items matching a filter. The [gossip]
//! module provides an implementation that announces new items to each neighbor at a fixed
//! interval and fetches announced items it has not seen yet.

use futures::Future;
use std::collections::BTreeSet;
use thiserror::Error;

pub mod gossip;
pub mod item;

pub use item::{Block, Digest, Item, Kind};

/// Errors that can occur when interacting with a [Distributor].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("distributor closed")]
    Closed,
}

/// Interface for sharing items with, and collecting items from, the network.
pub trait Distributor: Clone + Send + 'static {
    /// Make an item available to the network.
    ///
    /// Distributing an item that is already known has no effect.
    fn distribute(&mut self, item: Item) -> impl Future<Output = Result<(), Error>> + Send;

    /// Wait for items of the given `kinds` (and `block`, if provided) that are not in `exclude`.
    ///
    /// Resolves with a non-empty set as soon as at least one matching item is available. The
    /// request is canceled by dropping the returned future.
    fn get_items(
        &mut self,
        kinds: &[Kind],
        block: Option<Block>,
        exclude: &BTreeSet<Digest>,
    ) -> impl Future<Output = Result<BTreeSet<Item>, Error>> + Send;
}
