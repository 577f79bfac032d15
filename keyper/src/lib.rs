//! Coordinate per-block threshold-encryption key generation among keypers.
//!
//! For every block, each keyper deals a secret share to every other keyper and publishes a
//! witness committing to them. Once a keyper holds a share and a witness from every other
//! keyper, it publishes a nonce. Once it holds a nonce from every other keyper, it publishes its
//! share of the block's encryption key and moves on to the next block.
//!
//! Contributions are exchanged over any [keysim_broadcast::Distributor] and may arrive in any
//! order. The [Coordinator] only ever waits for items of the block it is working on, so
//! contributions for a later block are simply picked up once it gets there.

use keysim_broadcast::{Block, Kind};
use thiserror::Error;

mod coordinator;
pub use coordinator::{Config, Coordinator, Finished};
mod metrics;
pub mod protocol;

/// Errors that can occur while running the handshake.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{0} attributed to self")]
    SelfAttributed(Kind),
    #[error("item for block {found} recorded in block {expected}")]
    WrongBlock { expected: Block, found: Block },
    #[error("distributor failed: {0}")]
    Distributor(#[from] keysim_broadcast::Error),
}
