//! Vote on each block once it has been collated and its decryption key is available.

use super::Event;
use futures::channel::mpsc;
use keysim_broadcast::{Distributor, Error, Item, Kind};
use keysim_p2p::PeerId;
use keysim_runtime::{Clock, SystemTimeExt};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Configuration of a validator.
#[derive(Clone, Debug)]
pub struct Config {
    pub public_key: PeerId,

    /// Number of distinct decryption key shares required to decrypt a block.
    pub threshold: usize,
}

/// Vote on consecutive blocks, starting at block 0.
pub async fn run<E: Clock, D: Distributor>(
    context: E,
    mut distributor: D,
    cfg: Config,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    let mut block = 0;
    loop {
        // Wait for the block's collation
        distributor
            .get_items(&[Kind::Collation], Some(block), &BTreeSet::new())
            .await?;
        debug!(me = %cfg.public_key, block, "received collation");

        // Wait for enough decryption key shares
        let mut seen = BTreeSet::new();
        let mut senders = BTreeSet::new();
        while senders.len() < cfg.threshold {
            let shares = distributor
                .get_items(&[Kind::DecKeyShare], Some(block), &seen)
                .await?;
            for share in shares {
                seen.insert(share.digest());
                senders.extend(share.sender());
            }
        }
        debug!(me = %cfg.public_key, block, "received decryption key");

        distributor
            .distribute(Item::Vote {
                block,
                sender: cfg.public_key,
            })
            .await?;
        info!(
            me = %cfg.public_key,
            block,
            time = ?context.current().epoch(),
            "voted"
        );
        let _ = events.unbounded_send(Event::Voted {
            validator: cfg.public_key,
            block,
        });
        block += 1;
    }
}
