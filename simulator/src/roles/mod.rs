//! Services run by each kind of peer.
//!
//! Every role interacts with the network only through a [keysim_broadcast::Distributor] and
//! reports what it accomplished as an [Event].

use keysim_broadcast::Block;
use keysim_p2p::PeerId;
use std::time::SystemTime;

pub mod collator;
pub mod keyper;
pub mod user;
pub mod validator;

/// Milestone reached by a role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A keyper finished key generation for a block.
    Finished {
        keyper: PeerId,
        block: Block,
        at: SystemTime,
    },
    /// A user saw enough encryption key shares to move on to the next block.
    Advanced { user: PeerId, block: Block },
    /// The collator published a collation.
    Collated { block: Block, transactions: usize },
    /// A validator voted on a block.
    Voted { validator: PeerId, block: Block },
}
