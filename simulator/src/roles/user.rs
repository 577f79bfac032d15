//! Create transactions and follow the block height through encryption key shares.

use super::Event;
use futures::{channel::mpsc, pin_mut, select_biased, FutureExt};
use keysim_broadcast::{Distributor, Error, Item, Kind};
use keysim_p2p::PeerId;
use keysim_runtime::{Clock, SystemTimeExt};
use rand::Rng;
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, trace};

/// Configuration of a user.
#[derive(Clone, Debug)]
pub struct Config {
    pub public_key: PeerId,

    /// Number of distinct encryption key shares that complete a block.
    pub threshold: usize,

    /// Interval between transactions.
    pub interval: Duration,
}

/// Create a transaction for the current block every `interval` (the first one at a random offset)
/// until the distributor closes.
pub async fn run<E: Clock + Rng, D: Distributor>(
    mut context: E,
    mut distributor: D,
    cfg: Config,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    let offset = context.gen_range(0..cfg.interval.as_nanos().max(1) as u64);
    let mut next = context.current() + Duration::from_nanos(offset);
    let mut block = 0;
    let mut seen = BTreeSet::new();
    let mut senders = BTreeSet::new();
    loop {
        let shares = {
            let tick = context.sleep_until(next).fuse();
            let shares = distributor
                .get_items(&[Kind::EncKeyShare], Some(block), &seen)
                .fuse();
            pin_mut!(tick, shares);
            select_biased! {
                _ = tick => None,
                result = shares => Some(result?),
            }
        };

        let Some(shares) = shares else {
            let token: u64 = context.gen();
            distributor
                .distribute(Item::Transaction { block, token })
                .await?;
            trace!(me = %cfg.public_key, block, "created transaction");
            next += cfg.interval;
            continue;
        };
        for share in shares {
            seen.insert(share.digest());
            senders.extend(share.sender());
        }
        if senders.len() < cfg.threshold {
            continue;
        }
        block += 1;
        seen.clear();
        senders.clear();
        debug!(
            me = %cfg.public_key,
            block,
            time = ?context.current().epoch(),
            "advanced block"
        );
        let _ = events.unbounded_send(Event::Advanced {
            user: cfg.public_key,
            block,
        });
    }
}
