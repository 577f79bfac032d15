//! Bundle the transactions of each block into a collation at a fixed interval.

use super::Event;
use futures::{channel::mpsc, pin_mut, select_biased, FutureExt};
use keysim_broadcast::{Distributor, Error, Item, Kind};
use keysim_p2p::PeerId;
use keysim_runtime::{Clock, SystemTimeExt};
use std::{collections::BTreeSet, time::Duration};
use tracing::info;

/// Configuration of the collator.
#[derive(Clone, Debug)]
pub struct Config {
    pub public_key: PeerId,

    /// Interval between collations.
    pub interval: Duration,
}

/// Every `interval`, publish a collation of the transactions seen for the current block and move
/// on to the next block.
pub async fn run<E: Clock, D: Distributor>(
    context: E,
    mut distributor: D,
    cfg: Config,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    let mut next = context.current() + cfg.interval;
    let mut block = 0;
    let mut transactions = BTreeSet::new();
    loop {
        let fetched = {
            let tick = context.sleep_until(next).fuse();
            let fetched = distributor
                .get_items(&[Kind::Transaction], Some(block), &transactions)
                .fuse();
            pin_mut!(tick, fetched);
            select_biased! {
                _ = tick => None,
                result = fetched => Some(result?),
            }
        };
        if let Some(fetched) = fetched {
            transactions.extend(fetched.iter().map(Item::digest));
            continue;
        }

        distributor
            .distribute(Item::Collation {
                block,
                sender: cfg.public_key,
                transactions: transactions.len(),
            })
            .await?;
        info!(
            me = %cfg.public_key,
            block,
            transactions = transactions.len(),
            time = ?context.current().epoch(),
            "created collation"
        );
        let _ = events.unbounded_send(Event::Collated {
            block,
            transactions: transactions.len(),
        });
        block += 1;
        transactions.clear();
        next += cfg.interval;
    }
}
